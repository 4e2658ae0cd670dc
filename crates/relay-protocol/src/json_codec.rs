//! JSON encoding/decoding for relay envelopes.
//!
//! One envelope is one JSON object:
//!
//! ```text
//! {"command":"register","username":"alice","password":"pw"}
//! {"command":"login","username":"alice","password":"pw"}
//! {"status":"ok","message":"..."}                      (auth reply, untagged)
//! {"command":"get_users"}
//! {"command":"user_list","users":{"alice":"online","bob":"offline"}}
//! {"command":"msg","from":"alice","to":"bob","body":"hi","timestamp":"..."}
//! {"command":"typing","from":"alice","to":"bob","status":"start"}
//! {"command":"status_update","user":"alice","status":"online"}
//! ```
//!
//! Fields beyond the ones a command needs are ignored. Framing (the
//! trailing newline) is appended by [`encode_envelope`] and stripped by
//! the `frame` module before [`decode_envelope`] sees the payload.

use relay_core::{
    AuthReply, ChatMessage, Credentials, Envelope, StatusUpdate, TypingNotice, UserList,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::wire_types::{is_known_command, COMMAND_FIELD, FRAME_DELIMITER};

/// Errors that can arise when encoding/decoding a single envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload is not valid UTF-8 JSON.
    #[error("malformed JSON: {0}")]
    Malformed(serde_json::Error),

    /// Valid JSON, but not an object.
    #[error("envelope is not a JSON object")]
    NotAnObject,

    /// Tagged with a command this relay does not know.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// No command tag and not an auth reply either.
    #[error("envelope carries no command")]
    MissingCommand,

    /// Known command with missing or mistyped fields.
    #[error("invalid `{command}` envelope: {reason}")]
    InvalidFields { command: String, reason: String },

    #[error("encode error: {0}")]
    Encode(serde_json::Error),
}

/// Borrowed mirror of the tagged envelopes, for encoding.
#[derive(Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum TaggedRef<'a> {
    Register(&'a Credentials),
    Login(&'a Credentials),
    GetUsers,
    UserList(&'a UserList),
    Msg(&'a ChatMessage),
    Typing(&'a TypingNotice),
    StatusUpdate(&'a StatusUpdate),
}

/// Owned mirror of the tagged envelopes, for decoding.
#[derive(Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Tagged {
    Register(Credentials),
    Login(Credentials),
    GetUsers,
    UserList(UserList),
    Msg(ChatMessage),
    Typing(TypingNotice),
    StatusUpdate(StatusUpdate),
}

impl From<Tagged> for Envelope {
    fn from(tagged: Tagged) -> Self {
        match tagged {
            Tagged::Register(c) => Envelope::Register(c),
            Tagged::Login(c) => Envelope::Login(c),
            Tagged::GetUsers => Envelope::GetUsers,
            Tagged::UserList(u) => Envelope::UserList(u),
            Tagged::Msg(m) => Envelope::Msg(m),
            Tagged::Typing(t) => Envelope::Typing(t),
            Tagged::StatusUpdate(s) => Envelope::StatusUpdate(s),
        }
    }
}

/// Decode a single envelope from one frame payload (delimiter excluded).
pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_slice(payload).map_err(ProtocolError::Malformed)?;

    let tag = match value.as_object() {
        None => return Err(ProtocolError::NotAnObject),
        Some(obj) => match obj.get(COMMAND_FIELD) {
            Some(Value::String(tag)) => Some(tag.clone()),
            Some(other) => return Err(ProtocolError::UnknownCommand(other.to_string())),
            None => None,
        },
    };

    match tag {
        Some(command) => {
            if !is_known_command(&command) {
                return Err(ProtocolError::UnknownCommand(command));
            }
            serde_json::from_value::<Tagged>(value)
                .map(Envelope::from)
                .map_err(|e| ProtocolError::InvalidFields {
                    command,
                    reason: e.to_string(),
                })
        }
        None => serde_json::from_value::<AuthReply>(value)
            .map(Envelope::AuthReply)
            .map_err(|_| ProtocolError::MissingCommand),
    }
}

/// Encode an envelope as one JSON object followed by the frame delimiter.
pub fn encode_envelope(env: &Envelope, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let result = match env {
        Envelope::AuthReply(reply) => serde_json::to_writer(&mut *out, reply),
        Envelope::Register(c) => serde_json::to_writer(&mut *out, &TaggedRef::Register(c)),
        Envelope::Login(c) => serde_json::to_writer(&mut *out, &TaggedRef::Login(c)),
        Envelope::GetUsers => serde_json::to_writer(&mut *out, &TaggedRef::GetUsers),
        Envelope::UserList(u) => serde_json::to_writer(&mut *out, &TaggedRef::UserList(u)),
        Envelope::Msg(m) => serde_json::to_writer(&mut *out, &TaggedRef::Msg(m)),
        Envelope::Typing(t) => serde_json::to_writer(&mut *out, &TaggedRef::Typing(t)),
        Envelope::StatusUpdate(s) => {
            serde_json::to_writer(&mut *out, &TaggedRef::StatusUpdate(s))
        }
    };
    result.map_err(ProtocolError::Encode)?;

    out.push(FRAME_DELIMITER);
    Ok(())
}
