use serde_json::Value;
use thiserror::Error;

use permasockets::PermaSocketError;

/// Main error type for ledgerlink
///
/// `Clone` on purpose: a terminal stream error fans out to every caller
/// waiting on the same handle's `join()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// Transport-level failure from the underlying connection
    #[error(transparent)]
    Socket(#[from] PermaSocketError),

    /// A stream with this id is already registered
    #[error("Stream '{0}' is already registered")]
    DuplicateStream(String),

    /// The handle is closed or was never registered
    #[error("Stream '{0}' is not registered")]
    StreamClosed(String),

    /// Server rejected the connection handshake
    #[error("Handshake rejected: {payload}")]
    HandshakeRejected { payload: Value },

    /// Server sent a terminal error frame for one stream
    #[error("Stream '{id}' failed: {payload}")]
    StreamFailed { id: String, payload: Value },

    /// Marker failed validation at the point it was set
    #[error("Invalid marker: {0}")]
    InvalidMarker(String),

    /// Credential fetch failed
    #[error("Token fetch failed: {0}")]
    TokenFetch(String),

    /// Outbound frame could not be built
    #[error("Encode error: {0}")]
    Encode(String),

    /// Inbound frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The connection ended while streams were still registered
    #[error("Connection terminated: {0}")]
    Terminated(String),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

/// Result type for ledgerlink operations
pub type Result<T> = std::result::Result<T, LinkError>;
