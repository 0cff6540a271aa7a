//! Upstream agent client error types.

use thiserror::Error;

/// Result type for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Errors that can occur while talking to the upstream agent.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The agent could not be reached at all.
    #[error("Failed to connect to upstream agent at {url}: {message}")]
    Unreachable { url: String, message: String },

    /// The agent answered with a non-success status.
    #[error("Upstream agent returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The connection failed after the request was accepted.
    #[error("Upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The agent answered with a body we could not understand.
    #[error("Failed to parse upstream response: {0}")]
    InvalidResponse(String),

    /// Building the HTTP client failed.
    #[error("Failed to build upstream HTTP client: {0}")]
    Client(String),
}

impl UpstreamError {
    /// HTTP status reported by the agent, if it answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
