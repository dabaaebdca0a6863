//! Control-stream handshake and teardown payloads

use serde::{Deserialize, Serialize};

use super::message::UserId;

/// Auth method used by peer servers presenting the shared service token
pub const SERVICE_AUTH_METHOD: &str = "service";

/// Auth method used by end-user clients presenting a signed token
pub const TOKEN_AUTH_METHOD: &str = "token";

/// First frame a client sends on the control stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auth {
    /// "token" for users, "service" for peer servers
    pub method: String,
    pub credentials: String,
}

/// Successful handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOk {
    /// Authenticated identity (empty for peer connections)
    pub user_id: UserId,
    /// Session id assigned to this connection
    pub session_id: String,
}

/// Rejected handshake; the server closes the connection right after
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFailed {
    pub code: u32,
    pub message: String,
}

/// Graceful disconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goodbye {
    pub reason: String,
}
