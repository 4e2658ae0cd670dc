//! Durable store abstraction.
//!
//! The relay core only needs two seams:
//! - `AuthService`: the user directory and its credential verifiers
//! - `OfflineStore`: the per-recipient FIFO of undelivered messages
//!
//! `SqliteStore` implements both on one SQLite database.

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use relay_core::{Identity, QueuedMessage};

pub use sqlite::SqliteStore;

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// The username is taken; the stored credential is unchanged.
    Duplicate,
}

#[async_trait]
pub trait AuthService: Send + Sync + 'static {
    async fn register(&self, username: &str, secret: &str) -> Result<Registration>;

    /// `true` iff `username` exists and `secret` matches its verifier.
    async fn verify(&self, username: &str, secret: &str) -> Result<bool>;

    async fn is_registered(&self, username: &str) -> Result<bool>;

    /// Every registered identity, ordered.
    async fn usernames(&self) -> Result<Vec<Identity>>;
}

/// Row id of a queued message.
pub type QueueId = i64;

#[async_trait]
pub trait OfflineStore: Send + Sync + 'static {
    async fn enqueue(&self, msg: &QueuedMessage) -> Result<QueueId>;

    /// Queued messages for `recipient`, oldest first.
    async fn pending(&self, recipient: &str) -> Result<Vec<(QueueId, QueuedMessage)>>;

    /// Delete delivered rows in one transaction.
    async fn remove_delivered(&self, ids: &[QueueId]) -> Result<()>;

    /// Take every queued message for `recipient`, oldest first.
    async fn drain(&self, recipient: &str) -> Result<Vec<QueuedMessage>> {
        let pending = self.pending(recipient).await?;
        let ids: Vec<QueueId> = pending.iter().map(|(id, _)| *id).collect();
        self.remove_delivered(&ids).await?;
        Ok(pending.into_iter().map(|(_, msg)| msg).collect())
    }
}
