//! Connection core: configuration, state tracking and the resilient
//! [`Connection`](connection::Connection) itself.

pub mod config;
pub mod connection;
pub mod connection_state;
pub mod url;

// Re-export main types
pub use config::{ConnectionConfig, KeepAlive, ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
pub use connection::Connection;
pub use connection_state::{AtomicSocketMetrics, ConnectionState, SocketMetrics, StateCell};
pub use url::compose_token_url;

// Re-export traits for convenience
pub use crate::traits::*;
