//! Multiplexed streams over one connection: registry, routing, restarts.

pub mod handle;
mod handshake;
pub mod metrics;
pub mod mux;

pub use handle::StreamHandle;
pub use metrics::{StreamMetrics, StreamStats};
pub use mux::{MuxOptions, StreamMux};
