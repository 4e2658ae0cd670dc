//! relay-core
//!
//! Pure relay domain logic:
//! - envelopes (the protocol messages, one variant per command)
//! - presence and typing states
//! - identity validation
//! - offline queue records and server timestamps

pub mod presence;
pub mod messages;
pub mod identity;
pub mod queued;
pub mod time;
pub mod error;

pub use presence::{Presence, TypingState};

pub use messages::{
    AuthReply,
    AuthStatus,
    ChatMessage,
    Credentials,
    Envelope,
    StatusUpdate,
    TypingNotice,
    UserList,
};

pub use identity::{validate_credentials, Identity, MAX_USERNAME_LEN};
pub use queued::QueuedMessage;
pub use time::server_timestamp;
pub use error::RelayError;
