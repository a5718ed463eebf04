//! # LedgerLink
//!
//! Resumable, multiplexed streaming sessions over a self-healing WebSocket.
//!
//! ## Features
//!
//! - **One socket, many streams**: a [`StreamMux`] routes inbound frames to
//!   registered handles by correlation id
//! - **Pick-up-where-you-left-off**: handles carry a [`ResumeMarker`]
//!   (integer position or opaque cursor, per protocol) that augments every
//!   restarted registration
//! - **Survives reconnects**: after the connection heals itself, the mux
//!   re-handshakes where required and re-registers every stream
//! - **Protocol pluggable**: the native listen protocol and a
//!   GraphQL-over-WebSocket protocol ship in [`protocol`]; anything speaking
//!   correlation-id frames can implement [`StreamProtocol`]
//! - **Tokens that rotate themselves**: a [`CredentialManager`] caches,
//!   deduplicates, and proactively refreshes bearer tokens, feeding each
//!   new one to the connection for its next dial

pub mod credentials;
pub mod error;
pub mod protocol;
pub mod stream;

// Re-export the error type
pub use error::LinkError;

// Re-export the caller-facing surface of each module
pub use credentials::{
    CredentialManager, CredentialOptions, FileTokenStore, MemoryTokenStore, TokenFetcher,
    TokenRecord, TokenStore,
};
pub use protocol::{
    graphql::{GraphqlOperation, GraphqlProtocol},
    listen::{ListenProtocol, ListenRequest, KEEP_ALIVE_FRAME},
    Inbound, MarkerKind, ResumeMarker, StreamProtocol,
};
pub use stream::{MuxOptions, StreamHandle, StreamMux, StreamStats};

/// Type alias for Result with LinkError
pub type Result<T> = std::result::Result<T, error::LinkError>;
