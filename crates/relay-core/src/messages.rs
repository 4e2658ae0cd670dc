//! Envelope types exchanged between clients and the relay.
//!
//! These are **transport-agnostic** logical messages. Every envelope is
//! one variant of [`Envelope`] carrying only the fields its command needs.
//!
//! Note: the JSON line encoding lives in the `relay-protocol` crate;
//! this module only defines the payload shapes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::presence::{Presence, TypingState};

/// A single unit of protocol exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Claim a username (client → server). Never creates a session.
    Register(Credentials),

    /// Authenticate and establish a session (client → server).
    Login(Credentials),

    /// Outcome of `Register` / `Login` (server → client).
    AuthReply(AuthReply),

    /// Ask for the presence snapshot (client → server).
    GetUsers,

    /// Presence snapshot of every known identity (server → client).
    UserList(UserList),

    /// Direct message (either direction).
    Msg(ChatMessage),

    /// Typing indicator (either direction). Never queued.
    Typing(TypingNotice),

    /// Presence transition of one identity (server → client).
    StatusUpdate(StatusUpdate),
}

/// Username + secret pair for `register` and `login`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// Passwords stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Ok,
    Error,
}

/// Reply to an authentication request. On the wire this is the only
/// envelope without a `command` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReply {
    pub status: AuthStatus,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    /// Identity -> presence, ordered by identity.
    pub users: BTreeMap<String, Presence>,
}

/// A direct message.
///
/// `from` and `timestamp` are optional on ingress; the relay overwrites
/// both with the authenticated sender and its receipt time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub from: String,
    pub to: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    #[serde(default)]
    pub from: String,
    pub to: String,
    pub status: TypingState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub user: String,
    pub status: Presence,
}

impl Envelope {
    /// Wire tag of this envelope; `None` for the untagged auth reply.
    pub fn command(&self) -> Option<&'static str> {
        match self {
            Envelope::Register(_) => Some("register"),
            Envelope::Login(_) => Some("login"),
            Envelope::AuthReply(_) => None,
            Envelope::GetUsers => Some("get_users"),
            Envelope::UserList(_) => Some("user_list"),
            Envelope::Msg(_) => Some("msg"),
            Envelope::Typing(_) => Some("typing"),
            Envelope::StatusUpdate(_) => Some("status_update"),
        }
    }

    /// Commands only an authenticated connection may issue.
    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            Envelope::GetUsers | Envelope::Msg(_) | Envelope::Typing(_)
        )
    }

    /// Convenience constructor for a successful auth reply.
    pub fn auth_ok(message: impl Into<String>) -> Self {
        Envelope::AuthReply(AuthReply {
            status: AuthStatus::Ok,
            message: message.into(),
        })
    }

    /// Convenience constructor for a failed auth reply.
    pub fn auth_error(message: impl Into<String>) -> Self {
        Envelope::AuthReply(AuthReply {
            status: AuthStatus::Error,
            message: message.into(),
        })
    }

    pub fn status_update(user: impl Into<String>, status: Presence) -> Self {
        Envelope::StatusUpdate(StatusUpdate {
            user: user.into(),
            status,
        })
    }

    pub fn user_list(users: BTreeMap<String, Presence>) -> Self {
        Envelope::UserList(UserList { users })
    }

    /// Convenience constructor for an outgoing direct message.
    pub fn msg(
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<String>,
        timestamp: Option<String>,
    ) -> Self {
        Envelope::Msg(ChatMessage {
            from: from.into(),
            to: to.into(),
            body: body.into(),
            timestamp,
        })
    }
}
