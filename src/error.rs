//! Error types for the home-agent gateway.

use std::time::Duration;
use thiserror::Error;

/// Library-level error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport or handshake failure while talking to the tool provider.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Unexpected failure while setting up the provider session.
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// The provider declared a tool schema that cannot be compiled.
    #[error("Invalid schema for tool '{tool}': {message}")]
    SchemaConfiguration { tool: String, message: String },

    #[error("Tool '{name}' not found. Available tools are: {available}")]
    ToolNotFound { name: String, available: String },

    #[error("Invalid arguments: {0}")]
    Validation(String),

    #[error("Tool call failed: {0}")]
    ToolCall(String),

    #[error("No active connection to the tool provider")]
    NotConnected,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport closed")]
    TransportClosed,

    #[error("JSON-RPC error (code {code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("Trace store error: {0}")]
    TraceStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl GatewayError {
    /// Whether a failed connection attempt should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            GatewayError::Cancelled
                | GatewayError::Config(_)
                | GatewayError::SchemaConfiguration { .. }
        )
    }

    /// Whether the error means the underlying session can no longer be used.
    pub fn is_session_broken(&self) -> bool {
        matches!(self, GatewayError::TransportClosed)
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
