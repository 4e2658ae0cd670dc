//! Binary TCP server for the relay.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use relay_server::config::Config;
use relay_server::registry::SessionRegistry;
use relay_server::router::Router;
use relay_server::server;
use relay_server::store::SqliteStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay-server", about = "Direct-message relay over TCP")]
struct Cli {
    /// TOML config file; environment variables and flags override it.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// SQLite database holding users and the offline queue.
    #[arg(long)]
    database: Option<PathBuf>,

    #[arg(long)]
    max_clients: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("relay_server=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = cli.database {
        config.database_path = path;
    }
    if let Some(max_clients) = cli.max_clients {
        config.max_clients = max_clients;
    }

    info!(
        addr = %config.socket_addr_string(),
        max_clients = config.max_clients,
        database = %config.database_path.display(),
        "starting relay-server"
    );

    let store = Arc::new(SqliteStore::open(&config.database_path, config.password_cost)?);
    let router = Arc::new(Router::new(SessionRegistry::new(), store.clone(), store));

    let listener = server::bind(&config).await?;
    tokio::select! {
        res = server::serve(listener, Arc::new(config), router) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
