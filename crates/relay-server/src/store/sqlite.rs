//! SQLite implementation of `AuthService` and `OfflineStore`.
//!
//! One connection behind an async mutex; every statement is short, and
//! bcrypt work runs on the blocking pool outside the lock.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use relay_core::{Identity, QueuedMessage};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AuthService, OfflineStore, QueueId, Registration};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    username      TEXT PRIMARY KEY,
    password_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS offline_messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient TEXT NOT NULL,
    sender    TEXT NOT NULL,
    body      TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offline_recipient
    ON offline_messages (recipient, timestamp, id);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    password_cost: u32,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>, password_cost: u32) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        let store = Self::init(conn, password_cost)?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Throwaway database, for tests and ephemeral relays.
    pub fn open_in_memory(password_cost: u32) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn, password_cost)
    }

    fn init(conn: Connection, password_cost: u32) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create schema")?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
            password_cost,
        })
    }

    async fn password_hash(&self, username: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let hash = conn
            .query_row(
                "SELECT password_hash FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }
}

#[async_trait]
impl AuthService for SqliteStore {
    async fn register(&self, username: &str, secret: &str) -> Result<Registration> {
        // Skip the bcrypt work for an obvious duplicate; the primary key
        // still decides races.
        if self.is_registered(username).await? {
            return Ok(Registration::Duplicate);
        }

        let secret = secret.to_string();
        let cost = self.password_cost;
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(secret, cost))
            .await
            .context("password hashing task failed")??;

        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
            params![username, hash],
        );

        match inserted {
            Ok(_) => Ok(Registration::Created),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Ok(Registration::Duplicate)
            }
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn verify(&self, username: &str, secret: &str) -> Result<bool> {
        let Some(hash) = self.password_hash(username).await? else {
            return Ok(false);
        };

        let secret = secret.to_string();
        let ok = tokio::task::spawn_blocking(move || bcrypt::verify(secret, &hash))
            .await
            .context("password verification task failed")??;
        Ok(ok)
    }

    async fn is_registered(&self, username: &str) -> Result<bool> {
        Ok(self.password_hash(username).await?.is_some())
    }

    async fn usernames(&self) -> Result<Vec<Identity>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT username FROM users ORDER BY username")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}

#[async_trait]
impl OfflineStore for SqliteStore {
    async fn enqueue(&self, msg: &QueuedMessage) -> Result<QueueId> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO offline_messages (recipient, sender, body, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![msg.recipient, msg.sender, msg.body, msg.timestamp],
        )
        .context("failed to queue offline message")?;

        let id = conn.last_insert_rowid();
        debug!(id, recipient = %msg.recipient, sender = %msg.sender, "queued offline message");
        Ok(id)
    }

    async fn pending(&self, recipient: &str) -> Result<Vec<(QueueId, QueuedMessage)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, sender, body, timestamp FROM offline_messages
             WHERE recipient = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![recipient], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    QueuedMessage {
                        recipient: recipient.to_string(),
                        sender: row.get(1)?,
                        body: row.get(2)?,
                        timestamp: row.get(3)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn remove_delivered(&self, ids: &[QueueId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM offline_messages WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit().context("failed to delete delivered messages")?;
        Ok(())
    }
}
