//! Error handling for the delivery layer

use std::fmt;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Connection rejected at handshake
    AuthFailed(String),
    /// Shared binding store could not be reached
    StoreUnavailable(String),
    /// Transpond target has no binding anywhere in the cluster
    UnboundUser(String),
    /// Outbound connection to a peer process failed
    PeerUnreachable(String),
    /// Malformed frame or unknown method
    Protocol(String),
    /// Ack-mode message exceeded its retry budget
    DeliveryAbandoned(String),
    /// Encoded frame exceeds the receiver's frame limit
    MessageTooLarge(String),
    /// Network-related errors
    Network(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Connection errors
    Connection(String),
    /// Configuration error
    Config(String),
    /// Timeout error
    Timeout(String),
    /// Resource limit exceeded
    ResourceLimit(String),
    /// Server internal error
    Internal(String),
}

impl RelayError {
    pub const AUTH_FAILED: u32 = 1000;
    pub const STORE_UNAVAILABLE: u32 = 1001;
    pub const UNBOUND_USER: u32 = 1002;
    pub const PEER_UNREACHABLE: u32 = 1003;
    pub const PROTOCOL: u32 = 1004;
    pub const DELIVERY_ABANDONED: u32 = 1005;
    pub const MESSAGE_TOO_LARGE: u32 = 1013;

    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            RelayError::AuthFailed(_) => Self::AUTH_FAILED,
            RelayError::StoreUnavailable(_) => Self::STORE_UNAVAILABLE,
            RelayError::UnboundUser(_) => Self::UNBOUND_USER,
            RelayError::PeerUnreachable(_) => Self::PEER_UNREACHABLE,
            RelayError::Protocol(_) => Self::PROTOCOL,
            RelayError::DeliveryAbandoned(_) => Self::DELIVERY_ABANDONED,
            RelayError::MessageTooLarge(_) => Self::MESSAGE_TOO_LARGE,
            RelayError::Network(_) => 1006,
            RelayError::Serialization(_) => 1007,
            RelayError::Connection(_) => 1008,
            RelayError::Config(_) => 1009,
            RelayError::Timeout(_) => 1010,
            RelayError::ResourceLimit(_) => 1011,
            RelayError::Internal(_) => 1012,
        }
    }

    /// Get human-readable error message
    pub fn message(&self) -> &str {
        match self {
            RelayError::AuthFailed(msg)
            | RelayError::StoreUnavailable(msg)
            | RelayError::UnboundUser(msg)
            | RelayError::PeerUnreachable(msg)
            | RelayError::Protocol(msg)
            | RelayError::DeliveryAbandoned(msg)
            | RelayError::MessageTooLarge(msg)
            | RelayError::Network(msg)
            | RelayError::Serialization(msg)
            | RelayError::Connection(msg)
            | RelayError::Config(msg)
            | RelayError::Timeout(msg)
            | RelayError::ResourceLimit(msg)
            | RelayError::Internal(msg) => msg,
        }
    }

    /// Failures the Ack/Retry engine may attempt again
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::PeerUnreachable(_))
    }

    pub fn auth_failed<T: Into<String>>(msg: T) -> Self {
        RelayError::AuthFailed(msg.into())
    }

    pub fn store_unavailable<T: Into<String>>(msg: T) -> Self {
        RelayError::StoreUnavailable(msg.into())
    }

    /// Create an unbound user error carrying the user id
    pub fn unbound_user<T: Into<String>>(user_id: T) -> Self {
        RelayError::UnboundUser(user_id.into())
    }

    pub fn peer_unreachable<T: Into<String>>(msg: T) -> Self {
        RelayError::PeerUnreachable(msg.into())
    }

    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        RelayError::Protocol(msg.into())
    }

    pub fn delivery_abandoned<T: Into<String>>(msg: T) -> Self {
        RelayError::DeliveryAbandoned(msg.into())
    }

    pub fn message_too_large<T: Into<String>>(msg: T) -> Self {
        RelayError::MessageTooLarge(msg.into())
    }

    pub fn network<T: Into<String>>(msg: T) -> Self {
        RelayError::Network(msg.into())
    }

    pub fn serialization<T: Into<String>>(msg: T) -> Self {
        RelayError::Serialization(msg.into())
    }

    pub fn connection<T: Into<String>>(msg: T) -> Self {
        RelayError::Connection(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        RelayError::Config(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        RelayError::Timeout(msg.into())
    }

    pub fn resource_limit<T: Into<String>>(msg: T) -> Self {
        RelayError::ResourceLimit(msg.into())
    }

    pub fn internal<T: Into<String>>(msg: T) -> Self {
        RelayError::Internal(msg.into())
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::AuthFailed(msg) => write!(f, "Authentication failed: {}", msg),
            RelayError::StoreUnavailable(msg) => write!(f, "Binding store unavailable: {}", msg),
            RelayError::UnboundUser(uid) => write!(f, "User {} is not bound to any server", uid),
            RelayError::PeerUnreachable(msg) => write!(f, "Peer unreachable: {}", msg),
            RelayError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            RelayError::DeliveryAbandoned(msg) => write!(f, "Delivery abandoned: {}", msg),
            RelayError::MessageTooLarge(msg) => write!(f, "Message too large: {}", msg),
            RelayError::Network(msg) => write!(f, "Network error: {}", msg),
            RelayError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            RelayError::Connection(msg) => write!(f, "Connection error: {}", msg),
            RelayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RelayError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            RelayError::ResourceLimit(msg) => write!(f, "Resource limit exceeded: {}", msg),
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Network(format!("IO error: {}", err))
    }
}

impl From<quinn::ConnectError> for RelayError {
    fn from(err: quinn::ConnectError) -> Self {
        RelayError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ConnectionError> for RelayError {
    fn from(err: quinn::ConnectionError) -> Self {
        RelayError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ReadError> for RelayError {
    fn from(err: quinn::ReadError) -> Self {
        RelayError::Network(format!("QUIC read error: {}", err))
    }
}

impl From<quinn::WriteError> for RelayError {
    fn from(err: quinn::WriteError) -> Self {
        RelayError::Network(format!("QUIC write error: {}", err))
    }
}

impl From<quinn::ClosedStream> for RelayError {
    fn from(err: quinn::ClosedStream) -> Self {
        RelayError::Connection(format!("Stream closed: {}", err))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(err: redis::RedisError) -> Self {
        RelayError::StoreUnavailable(format!("Redis error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RelayError::Timeout("operation timed out".to_string())
    }
}
