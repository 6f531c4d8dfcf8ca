//! Error types for the adapter core.

use std::time::Duration;

/// Result type for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors raised while installing, supervising, or talking to the child server.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Missing or invalid startup configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A package could not be installed or verified.
    #[error("Package installation failed for {key}: {message}")]
    Install { key: String, message: String },

    /// An installed npm package has no runnable entry point.
    #[error("Could not resolve entry point for {package}: {message}")]
    EntryPoint { package: String, message: String },

    /// The child process could not be spawned or died during the startup grace period.
    #[error("Failed to start MCP server: {0}")]
    Startup(String),

    /// No live child process, even after a restart attempt.
    #[error("MCP server process not running")]
    NotRunning,

    /// The child accepted a request but did not answer in time.
    #[error("Timed out after {after:?} waiting for response from MCP server")]
    Timeout { after: Duration },

    /// The child closed its stdout instead of answering.
    #[error("No response from MCP server")]
    NoResponse,

    /// The child answered with a line that is not JSON, or one past the size limit.
    #[error("Invalid JSON response from MCP server: {0}")]
    InvalidResponse(String),

    /// Pipe or filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure on our side of the pipe.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AdapterError {
    pub fn install(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Install {
            key: key.into(),
            message: message.into(),
        }
    }
}
