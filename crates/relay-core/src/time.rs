//! Server receipt timestamps.

use chrono::Utc;

/// UTC wall-clock format used on the wire and in the offline queue.
///
/// Fixed-width, so lexicographic order equals chronological order,
/// including across DST changes.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Timestamp stamped on every `msg` envelope at ingress.
pub fn server_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}
