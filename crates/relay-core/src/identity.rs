//! Identities and credential validation.

use crate::error::RelayError;
use crate::messages::Credentials;

/// A unique username; the primary key of the user directory.
pub type Identity = String;

/// Longest accepted username, in characters.
pub const MAX_USERNAME_LEN: usize = 64;

/// Validate a register/login request before it reaches the store.
///
/// Returns the normalized (trimmed) username on success.
pub fn validate_credentials(creds: &Credentials) -> Result<Identity, RelayError> {
    let username = creds.username.trim();

    if username.is_empty() {
        return Err(RelayError::EmptyUsername);
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(RelayError::UsernameTooLong {
            max: MAX_USERNAME_LEN,
        });
    }
    if username.chars().any(char::is_control) {
        return Err(RelayError::InvalidUsername);
    }
    if creds.password.is_empty() {
        return Err(RelayError::EmptyPassword);
    }

    Ok(username.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(username: &str, password: &str) -> Credentials {
        Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn trims_username() {
        assert_eq!(validate_credentials(&creds("  alice ", "pw")).unwrap(), "alice");
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            validate_credentials(&creds("   ", "pw")),
            Err(RelayError::EmptyUsername)
        );
        assert_eq!(
            validate_credentials(&creds("bob", "")),
            Err(RelayError::EmptyPassword)
        );
        assert_eq!(
            validate_credentials(&creds("a\u{7}b", "pw")),
            Err(RelayError::InvalidUsername)
        );

        let long = "x".repeat(MAX_USERNAME_LEN + 1);
        assert_eq!(
            validate_credentials(&creds(&long, "pw")),
            Err(RelayError::UsernameTooLong {
                max: MAX_USERNAME_LEN
            })
        );
    }
}
