//! Low-level wire constants.
//!
//! The actual encode/decode logic lives in `json_codec` and `frame`.

/// Frame boundary. serde_json escapes newlines inside strings, so this
/// byte never appears inside an encoded envelope.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Default upper bound for a single frame, delimiter excluded.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Name of the JSON field carrying the command tag.
pub const COMMAND_FIELD: &str = "command";

/// Every command tag the relay understands.
pub const KNOWN_COMMANDS: [&str; 7] = [
    "register",
    "login",
    "get_users",
    "user_list",
    "msg",
    "typing",
    "status_update",
];

pub fn is_known_command(tag: &str) -> bool {
    KNOWN_COMMANDS.contains(&tag)
}
