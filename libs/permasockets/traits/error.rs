use thiserror::Error;

/// Main error type for permasockets
///
/// Variants are string-carrying and `Clone` so a single terminal error can be
/// fanned out to every caller waiting on the same connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PermaSocketError {
    /// Transport-level failure (dial, read or write)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection closed while an operation was waiting on it
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation requires an open connection and none can be established
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Connect URL could not be built or parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Explicit shutdown raced an in-flight operation
    #[error("Connection shut down: {0}")]
    ShutDown(String),

    /// Invalid state transition
    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

/// Result type for permasockets operations
pub type Result<T> = std::result::Result<T, PermaSocketError>;
