//! Error types for the Jsonipc bridge.
//!
//! Every failure a caller can observe from a remote call, the transport or the
//! bootstrap handshake is expressed as a [`JsonipcError`] variant.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the Jsonipc bridge.
#[derive(Debug, Error)]
pub enum JsonipcError {
    // Connection errors
    #[error("Jsonipc: connection not open")]
    NotOpen,

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Connection lost: {cause}")]
    ConnectionLost { cause: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // Remote errors
    #[error("Jsonipc:{code}: {message}")]
    Remote { code: String, message: String },

    #[error("Failed to authenticate to engine: {message}")]
    AuthenticationFailed { message: String },

    // Wire format errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Input errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Jsonipc operations.
pub type Result<T> = std::result::Result<T, JsonipcError>;

impl From<serde_json::Error> for JsonipcError {
    fn from(err: serde_json::Error) -> Self {
        JsonipcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for JsonipcError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        JsonipcError::Transport {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for JsonipcError {
    fn from(err: url::ParseError) -> Self {
        JsonipcError::Validation {
            field: "endpoint".to_string(),
            message: err.to_string(),
        }
    }
}

impl JsonipcError {
    /// The engine-reported error code, if this is a remote error.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            JsonipcError::Remote { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Check if this error originates from the channel rather than the call.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            JsonipcError::NotOpen
                | JsonipcError::Transport { .. }
                | JsonipcError::ConnectionLost { .. }
        )
    }
}
