use async_trait::async_trait;

use super::error::PermaSocketError;

/// Why a session ended for good (no reconnection will follow).
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationReason {
    /// Server closed the socket with a normal or no-status code.
    RemoteClose { code: u16, reason: String },
    /// `disconnect()` was called on this side.
    LocalDisconnect,
    /// Transport died abnormally and the reconnection policy is disabled.
    Failed { message: String },
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::RemoteClose { code, reason } if reason.is_empty() => {
                write!(f, "remote close (code {})", code)
            }
            TerminationReason::RemoteClose { code, reason } => {
                write!(f, "remote close (code {}): {}", code, reason)
            }
            TerminationReason::LocalDisconnect => write!(f, "local disconnect"),
            TerminationReason::Failed { message } => write!(f, "connection failed: {}", message),
        }
    }
}

/// Lifecycle observer for a [`Connection`](crate::core::connection::Connection).
///
/// One interface covers every event the connection can emit. The connection
/// holds the handler for its whole session, so implementations are shared
/// (`Arc`) and internally synchronized.
#[async_trait]
pub trait SocketEventHandler: Send + Sync {
    /// Inbound text frame, delivered in transport order.
    fn on_frame(&self, frame: String);

    /// The transport dropped abnormally and was reopened. Fires exactly once
    /// per successful reconnection cycle, after the new transport is writable,
    /// so implementations may send frames from inside the callback.
    async fn on_reconnected(&self);

    /// Terminal close for this session. No further events follow.
    fn on_terminated(&self, reason: TerminationReason);

    /// Transport trouble surfaced for visibility (abnormal close, failed
    /// redial). Recovery is the connection's job; this is never a call-site
    /// failure.
    fn on_error(&self, error: &PermaSocketError);
}

/// Handler that ignores every event. Useful for tests and bare send/receive
/// use where nobody watches the lifecycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

#[async_trait]
impl SocketEventHandler for NoopEvents {
    fn on_frame(&self, _frame: String) {}

    async fn on_reconnected(&self) {}

    fn on_terminated(&self, _reason: TerminationReason) {}

    fn on_error(&self, _error: &PermaSocketError) {}
}
