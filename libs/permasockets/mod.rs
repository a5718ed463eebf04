//! # PermaSockets
//!
//! A WebSocket connection that refuses to stay down.
//!
//! ## Features
//!
//! - **One transport, one owner**: a `Connection` owns at most one physical
//!   socket; concurrent `connect()` calls join a single in-flight dial
//! - **Fixed-delay reconnection**: abnormal closes redial forever until
//!   success or an explicit `disconnect()`
//! - **Keep-alive**: periodic heartbeat frames, restarted on every reconnect
//! - **Single lifecycle interface**: frames, reconnections, termination and
//!   errors all arrive through one `SocketEventHandler`
//! - **Token-aware dialing**: the connect URL is rebuilt with the current
//!   bearer token on every attempt

pub mod core;
pub mod traits;

// Re-export all traits
pub use traits::*;

// Re-export core functionality
pub use core::{
    config, connection, connection_state, url,
    config::{ConnectionConfig, KeepAlive, ReconnectPolicy, DEFAULT_RECONNECT_DELAY},
    connection::Connection,
    connection_state::{AtomicSocketMetrics, ConnectionState, SocketMetrics, StateCell},
    url::compose_token_url,
};

/// Type alias for Result with PermaSocketError
pub type Result<T> = std::result::Result<T, traits::PermaSocketError>;
