//! relay-server
//!
//! Multi-client async TCP relay for direct messages, presence and
//! typing notifications, with an offline queue for absent recipients.

pub mod config;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;
pub mod types;

// internal, not re-exported
mod client;
