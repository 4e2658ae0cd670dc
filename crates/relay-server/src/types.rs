//! Shared types for the relay TCP server.
//!
//! This module defines:
//! - `ConnectionId`: a lightweight handle for accepted sockets
//! - outbound channel aliases between routing code and writer tasks
//! - `SessionHandle`: what the registry stores for an online identity

use std::fmt;
use std::sync::Arc;

use relay_core::{Envelope, Identity};
use tokio::sync::{mpsc, Notify};

/// Identifier for an accepted connection.
///
/// This is intentionally opaque; we just guarantee uniqueness
/// over the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outbound envelopes for one connection, consumed by its writer task.
pub type OutboundTx = mpsc::UnboundedSender<Envelope>;
pub type OutboundRx = mpsc::UnboundedReceiver<Envelope>;

/// Live binding of an identity to one connection.
///
/// Delivering to a handle never touches the socket: it pushes onto the
/// connection's outbound queue, so it cannot block on a slow peer.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub conn_id: ConnectionId,
    pub identity: Identity,
    tx: OutboundTx,
    shutdown: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(
        conn_id: ConnectionId,
        identity: impl Into<Identity>,
        tx: OutboundTx,
        shutdown: Arc<Notify>,
    ) -> Self {
        SessionHandle {
            conn_id,
            identity: identity.into(),
            tx,
            shutdown,
        }
    }

    /// Queue an envelope for this connection.
    ///
    /// Fails, handing the envelope back, once the writer has gone away.
    pub fn deliver(&self, env: Envelope) -> Result<(), Envelope> {
        self.tx.send(env).map_err(|err| err.0)
    }

    /// Ask the connection to shut down and run its cleanup.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Whether `other` refers to the same connection.
    pub fn same_connection(&self, other: &SessionHandle) -> bool {
        self.conn_id == other.conn_id
    }
}
