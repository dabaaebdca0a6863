//! Cluster-wide real-time message delivery over QUIC
//!
//! Server processes terminate user connections, bind each user to their own
//! address in a shared store, and relay ("transpond") frames to whichever
//! process holds the recipient's connection.

pub mod ack;
pub mod auth;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use auth::{Authenticator, SignedTokenAuthenticator};
pub use client::{ClientConfig, ClientEvent, RelayClient};
pub use config::{AckMode, ServerConfig};
pub use discovery::{Discover, MemoryStore, NoopDiscovery, RedisStore, StoreDiscovery};
pub use error::{RelayError, Result};
pub use protocol::{FrameType, Message, Method, Payload, UserId};
pub use server::{Server, ServerBuilder, ServerContext, ServerStats};

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique message ID
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
