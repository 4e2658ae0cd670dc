//! Offline queue records.

use crate::messages::{ChatMessage, Envelope};

/// A message waiting for its recipient's next login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub recipient: String,
    pub sender: String,
    pub body: String,
    pub timestamp: String,
}

impl QueuedMessage {
    /// Build a queue record from a routed message.
    ///
    /// Routed messages are always server-stamped; an unstamped one gets
    /// the current time.
    pub fn from_message(msg: &ChatMessage) -> Self {
        QueuedMessage {
            recipient: msg.to.clone(),
            sender: msg.from.clone(),
            body: msg.body.clone(),
            timestamp: msg
                .timestamp
                .clone()
                .unwrap_or_else(crate::time::server_timestamp),
        }
    }

    /// The `msg` envelope delivered at flush time, carrying the original
    /// timestamp.
    pub fn into_envelope(self) -> Envelope {
        Envelope::Msg(ChatMessage {
            from: self.sender,
            to: self.recipient,
            body: self.body,
            timestamp: Some(self.timestamp),
        })
    }
}
