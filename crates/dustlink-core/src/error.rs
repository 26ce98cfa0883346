//! Error types for dustlink.

use thiserror::Error;

/// Main error type for dustlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed before a status was received
    #[error("HTTP error: {0}")]
    Http(String),

    /// 401
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 403
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// 404
    #[error("Not found: {0}")]
    NotFound(String),

    /// 429
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// 5xx
    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    /// Any other non-success status
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// The response parsed but did not carry what the workflow step needs
    #[error("Step {step}: Unexpected response format: {message}")]
    UnexpectedResponse { step: u8, message: String },

    /// The agent reported a failure while generating its reply
    #[error("Agent error: {0}")]
    AgentFailed(String),

    /// Polling gave up
    #[error("Step {step}: No result after {attempts} attempts")]
    PollExhausted { step: u8, attempts: u32 },

    /// The per-call deadline elapsed
    #[error("Step {step}: Timed out after {seconds}s")]
    Timeout { step: u8, seconds: u64 },

    /// Caller supplied bad input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Map an HTTP status code and response body to an error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => Error::Unauthorized(message),
            403 => Error::Forbidden(message),
            404 => Error::NotFound(message),
            429 => Error::RateLimited(message),
            500..=599 => Error::ServerError { status, message },
            _ => Error::Api { status, message },
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::RateLimited(_) | Error::ServerError { .. }
        )
    }

    /// Workflow step already named in the message, if any.
    pub fn step(&self) -> Option<u8> {
        match self {
            Error::UnexpectedResponse { step, .. }
            | Error::PollExhausted { step, .. }
            | Error::Timeout { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Result type alias for dustlink operations.
pub type Result<T> = std::result::Result<T, Error>;
