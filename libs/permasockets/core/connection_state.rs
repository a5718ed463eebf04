//! Connection state tracking shared between the public handle and the
//! session task.
//!
//! State lives in a `tokio::sync::watch` cell rather than a bare atomic so
//! that a caller who finds the connection mid-dial can suspend until the
//! in-flight attempt settles instead of racing it.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport and no session task working on one
    Disconnected,
    /// A session task is dialing (first open or redial)
    Connecting,
    /// Transport open and writable
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        write!(f, "{}", s)
    }
}

/// Watchable connection state.
///
/// `set` never fails: the cell keeps its own receiver alive so the channel
/// cannot close under the writer.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
    _rx: watch::Receiver<ConnectionState>,
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, rx) = watch::channel(initial);
        Self { tx, _rx: rx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: ConnectionState) {
        // send_replace notifies watchers even when the value is unchanged,
        // which keeps joiners from missing a Connecting -> Connecting redial.
        self.tx.send_replace(state);
    }

    /// Receiver for waiting on state changes (`connect()` joiners).
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone)]
pub struct SocketMetrics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub reconnect_count: u64,
    pub connection_state: ConnectionState,
}

/// Lock-free counters updated from the session task and the send path.
#[derive(Debug, Default)]
pub struct AtomicSocketMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    reconnect_count: AtomicU64,
}

impl AtomicSocketMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, connection_state: ConnectionState) -> SocketMetrics {
        SocketMetrics {
            frames_sent: self.frames_sent(),
            frames_received: self.frames_received(),
            reconnect_count: self.reconnect_count(),
            connection_state,
        }
    }
}
