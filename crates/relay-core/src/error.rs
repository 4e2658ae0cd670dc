//! Error types for the relay domain.
//!
//! Only input validation can fail at this layer; transport and storage
//! failures are reported by the crates that own those concerns.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("username must not be empty")]
    EmptyUsername,

    #[error("username longer than {max} characters")]
    UsernameTooLong { max: usize },

    #[error("username contains control characters")]
    InvalidUsername,

    #[error("password must not be empty")]
    EmptyPassword,
}
