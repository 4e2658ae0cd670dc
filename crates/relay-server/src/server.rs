//! TCP listener and top-level server wiring.
//!
//! This module:
//! - Binds the configured address/port.
//! - Accepts new TCP connections, up to `max_clients` at once.
//! - Assigns each connection a `ConnectionId`.
//! - Spawns a per-connection task running the handler in `client`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::client;
use crate::config::Config;
use crate::router::Router;
use crate::types::ConnectionId;

/// Process-wide counter for assigning unique `ConnectionId`s.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    ConnectionId(id)
}

/// Bind the listening socket for `config`.
pub async fn bind(config: &Config) -> Result<TcpListener> {
    let addr = config.socket_addr_string();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %listener.local_addr()?, "listening");
    Ok(listener)
}

/// Accept connections on `listener` forever.
///
/// Connections beyond `max_clients` are closed immediately. Accept
/// errors are logged and the loop keeps going.
pub async fn serve(listener: TcpListener, config: Arc<Config>, router: Arc<Router>) -> Result<()> {
    let slots = Arc::new(Semaphore::new(config.max_clients));

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let permit = match slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    peer = %peer_addr,
                    max_clients = config.max_clients,
                    "rejecting connection: max_clients reached"
                );
                continue;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
        }

        let conn_id = next_connection_id();
        info!(conn = %conn_id, peer = %peer_addr, "accepted connection");

        let router = router.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match client::run_client(conn_id, stream, router, config).await {
                Ok(()) => info!(conn = %conn_id, "disconnected"),
                Err(err) => error!(conn = %conn_id, error = %err, "connection error"),
            }
        });
    }
}

/// Bind and serve with the given configuration.
pub async fn run(config: Config, router: Arc<Router>) -> Result<()> {
    let listener = bind(&config).await?;
    serve(listener, Arc::new(config), router).await
}
