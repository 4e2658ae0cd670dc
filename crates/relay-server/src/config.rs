//! Configuration for the relay TCP server.
//!
//! Layered, later layers win:
//!
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables
//! 4. command-line flags (applied by `main`)
//!
//! Environment variables:
//!
//! - `RELAY_HOST`            (default: "localhost")
//! - `RELAY_PORT`            (default: "8080")
//! - `RELAY_MAX_CLIENTS`     (default: "1024")
//! - `RELAY_DATABASE`        (default: "chat.db")
//! - `RELAY_MAX_FRAME_BYTES` (default: "65536")
//! - `RELAY_IDLE_TIMEOUT`    (seconds, default: "0" = never)
//! - `RELAY_PASSWORD_COST`   (bcrypt cost, default: bcrypt's default)

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host name or interface to bind to.
    pub host: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Maximum number of simultaneously open connections.
    pub max_clients: usize,

    /// SQLite file holding users and the offline queue.
    pub database_path: PathBuf,

    /// Longest accepted frame, in bytes.
    pub max_frame_bytes: usize,

    /// Close connections silent for this many seconds; `0` disables.
    pub idle_timeout_secs: u64,

    /// bcrypt cost for new password verifiers.
    pub password_cost: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 8080,
            max_clients: 1024,
            database_path: PathBuf::from("chat.db"),
            max_frame_bytes: relay_protocol::wire_types::DEFAULT_MAX_FRAME_LEN,
            idle_timeout_secs: 0,
            password_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl Config {
    /// Defaults, then `file` if given, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Construct a `Config` from environment variables, falling back
    /// to the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `RELAY_*` variables that are set.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("RELAY_HOST") {
            self.host = host;
        }
        if let Ok(path) = env::var("RELAY_DATABASE") {
            self.database_path = PathBuf::from(path);
        }
        self.port = read_env_or("RELAY_PORT", self.port)?;
        self.max_clients = read_env_or("RELAY_MAX_CLIENTS", self.max_clients)?;
        self.max_frame_bytes = read_env_or("RELAY_MAX_FRAME_BYTES", self.max_frame_bytes)?;
        self.idle_timeout_secs = read_env_or("RELAY_IDLE_TIMEOUT", self.idle_timeout_secs)?;
        self.password_cost = read_env_or("RELAY_PASSWORD_COST", self.password_cost)?;
        Ok(())
    }

    /// Convenience: `host:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

fn read_env_or<T>(key: &str, current: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid {}: {:?}", key, val)),
        Err(_) => Ok(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_server() {
        let config = Config::default();
        assert_eq!(config.socket_addr_string(), "localhost:8080");
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn toml_overrides_only_what_it_names() {
        let config = Config::from_toml(
            r#"
            port = 9100
            idle_timeout_secs = 300
            database_path = "/var/lib/relay/chat.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 9100);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.database_path, PathBuf::from("/var/lib/relay/chat.db"));
        assert_eq!(config.max_clients, 1024);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(Config::from_toml("port = \"eighty\"").is_err());
    }

    #[test]
    fn env_overrides_and_rejects_garbage() {
        env::set_var("RELAY_MAX_FRAME_BYTES", "2048");
        let config = Config::from_env().unwrap();
        assert_eq!(config.max_frame_bytes, 2048);

        env::set_var("RELAY_MAX_FRAME_BYTES", "lots");
        assert!(Config::from_env().is_err());
        env::remove_var("RELAY_MAX_FRAME_BYTES");
    }
}
