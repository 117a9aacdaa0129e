//! Error types for Tether
//!
//! Provides a unified error handling strategy using thiserror, plus the
//! structured `RpcError` that travels inside RPC envelopes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, TetherError>;

/// JSON-RPC "parse error"
pub const CODE_PARSE_ERROR: i64 = -32700;
/// JSON-RPC "method not found"
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC "invalid params"
pub const CODE_INVALID_PARAMS: i64 = -32602;
/// Missing or mismatched peer auth token
pub const CODE_UNAUTHORIZED: i64 = 401;
/// Relay policy rejected the caller
pub const CODE_FORBIDDEN: i64 = 403;
/// Call did not complete in time
pub const CODE_TIMEOUT: i64 = 408;
/// Socket id already in use
pub const CODE_CONFLICT: i64 = 409;
/// Generic handler failure
pub const CODE_INTERNAL: i64 = 500;

/// Unified error type for all Tether operations
#[derive(Error, Debug)]
pub enum TetherError {
    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Broker not connected")]
    BrokerDisconnected,

    #[error("HTTP fallback failed: {0}")]
    Http(String),

    #[error("Data channel error: {0}")]
    DataChannel(String),

    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("Remote error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),

    #[error("RPC call {method} timed out")]
    Timeout { method: String },

    // ─────────────────────────────────────────────────────────────
    // Negotiation Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    // ─────────────────────────────────────────────────────────────
    // Policy / Tunnel Errors
    // ─────────────────────────────────────────────────────────────
    #[error("host {host} not allowed for relay on port {port}")]
    PolicyDenied { host: String, port: u16 },

    #[error("no relay found for port: {0}")]
    NoRelay(u16),

    #[error("socket id already in use: {0}")]
    SocketExists(String),

    #[error("targetHost must be a different host: {0}")]
    SelfLoop(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Failed to bind to port {port}: {reason}")]
    PortBindFailed { port: u16, reason: String },

    #[error("Failed to connect to {target}: {reason}")]
    ConnectFailed { target: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TetherError {
    /// The RPC error code this failure is reported with on the wire
    pub fn rpc_code(&self) -> i64 {
        match self {
            TetherError::Rpc(err) => err.code,
            TetherError::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
            TetherError::InvalidMessage(_) => CODE_PARSE_ERROR,
            TetherError::InvalidParams(_) => CODE_INVALID_PARAMS,
            TetherError::Unauthorized(_) => CODE_UNAUTHORIZED,
            TetherError::PolicyDenied { .. } => CODE_FORBIDDEN,
            TetherError::Timeout { .. } => CODE_TIMEOUT,
            TetherError::SocketExists(_) => CODE_CONFLICT,
            _ => CODE_INTERNAL,
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for TetherError {
    fn from(err: bincode::Error) -> Self {
        TetherError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for TetherError {
    fn from(err: reqwest::Error) -> Self {
        TetherError::Http(err.to_string())
    }
}

impl From<toml::de::Error> for TetherError {
    fn from(err: toml::de::Error) -> Self {
        TetherError::ConfigError(err.to_string())
    }
}

impl From<toml::ser::Error> for TetherError {
    fn from(err: toml::ser::Error) -> Self {
        TetherError::ConfigError(err.to_string())
    }
}

/// Structured error carried in the `error` field of an RPC envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(CODE_METHOD_NOT_FOUND, format!("method not found: {}", method))
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(CODE_UNAUTHORIZED, message)
    }

    /// True for the 4xx family (auth, policy, conflict)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl From<TetherError> for RpcError {
    fn from(err: TetherError) -> Self {
        match err {
            TetherError::Rpc(inner) => inner,
            other => RpcError::new(other.rpc_code(), other.to_string()),
        }
    }
}
