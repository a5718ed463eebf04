//! Core traits and types for the permasockets connection library.
//!
//! - **SocketEventHandler**: single lifecycle interface (frames,
//!   reconnections, termination, errors)
//! - **PermaSocketError**: the crate error type

pub mod error;
pub mod events;

// Re-export commonly used types
pub use error::{PermaSocketError, Result};
pub use events::{NoopEvents, SocketEventHandler, TerminationReason};
