//! QUIC-based presence and message-fanout relay
//!
//! This library provides the real-time layer that sits beside a conventional
//! request/response chat API: it tracks which identities are connected, which
//! conversation rooms each connection has joined, and routes transient events
//! (typing indicators, message-delivery notifications) to the correct set of
//! live connections.

pub mod error;
pub mod protocol;
pub mod server;

pub use error::{RelayError, Result};
pub use server::RelayServer;

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Relay server configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Server listen address
    pub bind_addr: std::net::SocketAddr,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Connection idle timeout in seconds
    pub idle_timeout_secs: u64,
    /// Capacity of each session's outbound frame queue
    pub outbound_buffer: usize,
    /// Maximum rooms a single session may join
    pub max_rooms_per_session: usize,
    /// Maximum simultaneous sessions per identity
    pub max_sessions_per_identity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4433".parse().unwrap(),
            max_connections: 10000,
            idle_timeout_secs: 300,
            outbound_buffer: 256,
            max_rooms_per_session: 512,
            max_sessions_per_identity: 16,
        }
    }
}
