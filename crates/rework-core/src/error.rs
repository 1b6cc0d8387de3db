//! Error types for the ReWork messaging layer.
//!
//! Expected local failures (duplicate names, unknown modules or surfaces) are
//! reported through `bool` returns by the registries and only logged with these
//! variants. Faults that reach a caller of `RpcEngine::call` surface as `Err`.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the ReWork crates.
#[derive(Debug, Error)]
pub enum ReworkError {
    // Correlation errors
    #[error("RPC call timeout: {event} (no response after {after:?})")]
    Timeout { event: String, after: Duration },

    #[error("RPC call cancelled: {event}")]
    Cancelled { event: String },

    #[error("No handler registered for event: {event}")]
    HandlerNotFound { event: String },

    #[error("Handler for {event} failed: {message}")]
    HandlerFailed { event: String, message: String },

    #[error("Response for unknown or expired request id {id}")]
    StaleResponse { id: u64 },

    #[error("Request {id} was already answered")]
    AlreadyResponded { id: u64 },

    // Registry errors
    #[error("{kind} '{name}' is already registered")]
    DuplicateRegistration { kind: &'static str, name: String },

    #[error("Module not found: {name}")]
    ModuleNotFound { name: String },

    #[error("Surface not found: {name}")]
    SurfaceNotFound { name: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Configuration and validation errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Async runtime unavailable: {message}")]
    Runtime { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for ReWork operations.
pub type Result<T> = std::result::Result<T, ReworkError>;

impl From<std::io::Error> for ReworkError {
    fn from(err: std::io::Error) -> Self {
        ReworkError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ReworkError {
    fn from(err: serde_json::Error) -> Self {
        ReworkError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ReworkError {
    /// Shorthand for a transport failure with a message.
    pub fn transport(message: impl Into<String>) -> Self {
        ReworkError::Transport {
            message: message.into(),
        }
    }

    /// Check if a call that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReworkError::Timeout { .. } | ReworkError::Transport { .. } | ReworkError::Io { .. }
        )
    }
}
