//! Error taxonomy for the fetch pipeline.
//!
//! Every failure a transport can produce is folded into [`FetchError`] and
//! delivered as [`crate::outcome::FetchOutcome::TransportError`]. Errors are
//! `Clone` because a single outcome fans out to every coalesced listener.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// DNS failure, refused connection, TLS handshake failure.
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out")]
    Timeout,

    /// Server answered with a non-2xx status.
    #[error("HTTP status {code}")]
    Status { code: u16 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Resource unknown to an in-memory transport.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The transport panicked while servicing the request.
    #[error("Transport panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Whether the error happened before any response arrived.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout | Self::InvalidUrl(_))
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => Self::Connect(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Pipeline lifecycle errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Pipeline has been shut down")]
    ShutDown,
}
