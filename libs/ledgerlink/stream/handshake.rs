//! Connection-scoped handshake gate.
//!
//! Protocols with an init/ack exchange get exactly one init frame per
//! transport: the first caller leads (sends the frame), everyone else joins
//! and awaits the shared outcome. The gate arms on acknowledgement and is
//! re-opened after each reconnect.

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{LinkError, Result};

type Outcome = Option<Result<()>>;

enum GateState {
    Idle,
    Pending {
        tx: watch::Sender<Outcome>,
        rx: watch::Receiver<Outcome>,
        /// The init frame went out on a transport that has since died; the
        /// attempt needs re-leading, its waiters are still good.
        stale: bool,
    },
    Ready,
}

/// Role handed to a caller that needs the handshake established.
pub(crate) enum HandshakeTicket {
    /// Already acknowledged on this transport.
    Ready,
    /// Caller owns sending the init frame, then awaits the outcome.
    Lead(HandshakeWaiter),
    /// An init frame is already in flight; await the shared outcome.
    Join(HandshakeWaiter),
}

pub(crate) struct HandshakeWaiter {
    rx: watch::Receiver<Outcome>,
}

impl HandshakeWaiter {
    pub(crate) async fn outcome(mut self) -> Result<()> {
        loop {
            let settled = self.rx.borrow_and_update().clone();
            if let Some(result) = settled {
                return result;
            }
            if self.rx.changed().await.is_err() {
                return Err(LinkError::Terminated(
                    "connection closed during handshake".into(),
                ));
            }
        }
    }
}

pub(crate) struct HandshakeGate {
    state: Mutex<GateState>,
}

impl HandshakeGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
        }
    }

    /// Claim a role in establishing the handshake.
    pub(crate) fn ticket(&self) -> HandshakeTicket {
        let mut state = self.state.lock();
        match &*state {
            GateState::Ready => HandshakeTicket::Ready,
            GateState::Pending { rx, .. } => HandshakeTicket::Join(HandshakeWaiter {
                rx: rx.clone(),
            }),
            GateState::Idle => {
                let (tx, rx) = watch::channel(None);
                let waiter = HandshakeWaiter { rx: rx.clone() };
                *state = GateState::Pending {
                    tx,
                    rx,
                    stale: false,
                };
                HandshakeTicket::Lead(waiter)
            }
        }
    }

    /// Claim the lead for a fresh transport, keeping any waiters stranded
    /// by the previous one. Returns `None` when an attempt is already live
    /// on the current transport (no second init frame must go out).
    pub(crate) fn reopen(&self) -> Option<HandshakeWaiter> {
        let mut state = self.state.lock();
        match &mut *state {
            GateState::Pending { rx, stale, .. } => {
                if *stale {
                    *stale = false;
                    Some(HandshakeWaiter { rx: rx.clone() })
                } else {
                    None
                }
            }
            _ => {
                let (tx, rx) = watch::channel(None);
                let waiter = HandshakeWaiter { rx: rx.clone() };
                *state = GateState::Pending {
                    tx,
                    rx,
                    stale: false,
                };
                Some(waiter)
            }
        }
    }

    /// Settle the in-flight handshake for every waiter. Success arms the
    /// gate; failure returns it to idle so a later attempt can lead again.
    pub(crate) fn resolve(&self, result: Result<()>) {
        let mut state = self.state.lock();
        if let GateState::Pending { tx, .. } = &*state {
            let armed = result.is_ok();
            let _ = tx.send(Some(result));
            *state = if armed { GateState::Ready } else { GateState::Idle };
        }
    }

    /// Drop all handshake state. Pending waiters observe a closed channel
    /// and fail with `Terminated`.
    pub(crate) fn reset(&self) {
        *self.state.lock() = GateState::Idle;
    }

    /// The transport died: forget a completed handshake, and mark an
    /// in-flight attempt stale so the next `reopen` re-leads it. Waiters
    /// keep waiting either way.
    pub(crate) fn suspend(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            GateState::Ready => *state = GateState::Idle,
            GateState::Pending { stale, .. } => *stale = true,
            GateState::Idle => {}
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), GateState::Ready)
    }
}
