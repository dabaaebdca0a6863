//! Server configuration
//!
//! Loaded from a JSON file where every field is optional; durations are
//! written as `_secs` / `_ms` integers.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::protocol::frame::MAX_FRAME_SIZE;
use crate::transport::tls::TransportSettings;

/// Default namespace for binding-store keys
pub const DEFAULT_NAMESPACE: &str = "hermod.ws.discover";

/// Server configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server listen address
    pub bind_addr: SocketAddr,
    /// Address peers dial to reach this process; the bound address if unset
    pub advertise_addr: Option<String>,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Connection idle timeout in seconds
    pub idle_timeout_secs: u64,
    /// Time allowed for the Auth frame to arrive
    pub handshake_timeout_secs: u64,
    /// Maximum frame payload size in bytes
    pub max_message_size: usize,
    pub ack_mode: AckMode,
    pub retry: RetryPolicy,
    pub peer: PeerConfig,
    pub discovery: DiscoveryConfig,
    /// Secret for the signed-token authenticator
    pub auth_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4433)),
            advertise_addr: None,
            max_connections: 10_000,
            idle_timeout_secs: 300,
            handshake_timeout_secs: 10,
            max_message_size: MAX_FRAME_SIZE,
            ack_mode: AckMode::default(),
            retry: RetryPolicy::default(),
            peer: PeerConfig::default(),
            discovery: DiscoveryConfig::default(),
            auth_secret: None,
        }
    }
}

impl ServerConfig {
    /// Read a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            RelayError::config(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(RelayError::config("max_connections must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(RelayError::config("max_message_size must be positive"));
        }
        if self.retry.max_err_count == 0 {
            return Err(RelayError::config("retry.max_err_count must be positive"));
        }
        if self.discovery.kind == DiscoveryKind::Redis && self.discovery.redis_url.is_empty() {
            return Err(RelayError::config("redis discovery requires redis_url"));
        }
        self.peer.validate()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Acknowledgment behaviour for Data frames
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// No acks in either direction
    None,
    /// Inbound Data frames are acked before dispatch
    #[default]
    Only,
    /// Inbound acked, outbound tracked and retried
    Rigor,
}

impl AckMode {
    pub fn acks_inbound(self) -> bool {
        self != AckMode::None
    }

    pub fn tracks_outbound(self) -> bool {
        self == AckMode::Rigor
    }
}

impl FromStr for AckMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(AckMode::None),
            "only" => Ok(AckMode::Only),
            "rigor" => Ok(AckMode::Rigor),
            other => Err(RelayError::config(format!("unknown ack mode: {}", other))),
        }
    }
}

/// Bounds for acknowledged delivery and peer retries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub ack_timeout_ms: u64,
    /// Transmissions before a message is abandoned
    pub max_err_count: u32,
    pub peer_retry_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 3_000,
            max_err_count: 3,
            peer_retry_backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn peer_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.peer_retry_backoff_ms)
    }
}

/// Outbound peer connections
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Shared credential presented with the "service" auth method
    pub service_token: String,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// A silent peer connection is dropped after this long
    pub idle_timeout_ms: u64,
    /// Must be below `idle_timeout_ms`
    pub keep_alive_ms: u64,
    /// Largest frame payload peers accept; their `max_message_size`
    pub max_message_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            service_token: String::new(),
            connect_timeout_ms: 2_000,
            send_timeout_ms: 2_000,
            idle_timeout_ms: 5_000,
            keep_alive_ms: 1_000,
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

impl PeerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Transport for the peer pool's endpoint. The short idle timeout is
    /// what turns a dead peer host into a closed connection.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            idle_timeout: self.idle_timeout(),
            keep_alive: Some(self.keep_alive()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.keep_alive_ms == 0 || self.keep_alive_ms >= self.idle_timeout_ms {
            return Err(RelayError::config(
                "peer.keep_alive_ms must be positive and below peer.idle_timeout_ms",
            ));
        }
        if self.max_message_size == 0 {
            return Err(RelayError::config("peer.max_message_size must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    /// Single process; bindings are not shared
    #[default]
    Noop,
    Redis,
}

/// Discovery backend selection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub kind: DiscoveryKind,
    pub redis_url: String,
    pub namespace: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            kind: DiscoveryKind::Noop,
            redis_url: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}
