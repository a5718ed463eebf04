//! One registered stream: its marker, activity flag, message delivery, and
//! the shared terminal cell behind `join()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{LinkError, Result};
use crate::protocol::marker::{MarkerKind, ResumeMarker};
use crate::protocol::StreamProtocol;
use crate::stream::mux::MuxCore;

pub(crate) type MessageCallback = Box<dyn Fn(Value) + Send + Sync>;
type RestartHook = Box<dyn Fn() + Send + Sync>;
type Terminal = Option<Result<()>>;

/// Registry-side state of one stream. Shared between the mux (which routes
/// to it) and every clone of the caller's [`StreamHandle`].
pub(crate) struct HandleInner<P: StreamProtocol> {
    id: String,
    registration: P::Registration,
    marker_kind: MarkerKind,
    marker: Mutex<Option<ResumeMarker>>,
    active: AtomicBool,
    on_message: MessageCallback,
    post_restart: RwLock<Option<RestartHook>>,
    terminal_tx: watch::Sender<Terminal>,
    terminal_rx: watch::Receiver<Terminal>,
}

impl<P: StreamProtocol> HandleInner<P> {
    pub(crate) fn new(
        id: String,
        registration: P::Registration,
        marker_kind: MarkerKind,
        on_message: MessageCallback,
    ) -> Self {
        let (terminal_tx, terminal_rx) = watch::channel(None);
        Self {
            id,
            registration,
            marker_kind,
            marker: Mutex::new(None),
            active: AtomicBool::new(true),
            on_message,
            post_restart: RwLock::new(None),
            terminal_tx,
            terminal_rx,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn registration(&self) -> &P::Registration {
        &self.registration
    }

    pub(crate) fn marker(&self) -> Option<ResumeMarker> {
        self.marker.lock().clone()
    }

    pub(crate) fn set_marker(&self, marker: ResumeMarker) {
        *self.marker.lock() = Some(marker);
    }

    pub(crate) fn marker_kind(&self) -> MarkerKind {
        self.marker_kind
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub(crate) fn deliver(&self, body: Value) {
        (self.on_message)(body);
    }

    pub(crate) fn set_post_restart(&self, hook: RestartHook) {
        *self.post_restart.write() = Some(hook);
    }

    pub(crate) fn run_post_restart(&self) {
        if let Some(hook) = self.post_restart.read().as_ref() {
            hook();
        }
    }

    /// First settle wins; later calls keep the recorded outcome.
    pub(crate) fn settle(&self, result: Result<()>) {
        self.terminal_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(result);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn terminal(&self) -> watch::Receiver<Terminal> {
        self.terminal_rx.clone()
    }
}

/// Caller-facing handle to one registered stream.
///
/// Cheap to clone; all clones refer to the same registration and share one
/// terminal outcome.
pub struct StreamHandle<P: StreamProtocol> {
    inner: Arc<HandleInner<P>>,
    mux: Weak<MuxCore<P>>,
}

impl<P: StreamProtocol> std::fmt::Debug for StreamHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl<P: StreamProtocol> Clone for StreamHandle<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            mux: self.mux.clone(),
        }
    }
}

impl<P: StreamProtocol> StreamHandle<P> {
    pub(crate) fn new(inner: Arc<HandleInner<P>>, mux: Weak<MuxCore<P>>) -> Self {
        Self { inner, mux }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Registered on the live transport (drops to `false` while the
    /// connection is down or after a terminal server error, back to `true`
    /// once restarted).
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Currently stored resumption marker, if any.
    pub fn marker(&self) -> Option<ResumeMarker> {
        self.inner.marker()
    }

    /// Record the resumption point used by later restarts.
    ///
    /// Validation is synchronous: a zero position, an empty cursor, or a
    /// marker of the wrong kind for this protocol errors here, never on a
    /// later restart.
    pub fn mark(&self, marker: ResumeMarker) -> Result<()> {
        marker.validate_for(self.inner.marker_kind())?;
        self.inner.set_marker(marker);
        Ok(())
    }

    /// Hook invoked after each restart's registration frame has been sent.
    pub fn set_post_restart<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.set_post_restart(Box::new(hook));
    }

    /// Re-send the registration frame.
    ///
    /// An explicit marker wins over the stored one for this call only; with
    /// neither, the original registration goes out unaugmented. Errors with
    /// [`LinkError::StreamClosed`] once the stream has been unregistered.
    pub async fn restart(&self, marker: Option<ResumeMarker>) -> Result<()> {
        if let Some(marker) = &marker {
            marker.validate_for(self.inner.marker_kind())?;
        }
        let mux = self
            .mux
            .upgrade()
            .ok_or_else(|| LinkError::StreamClosed(self.inner.id().to_string()))?;
        mux.restart_handle(&self.inner, marker).await
    }

    /// Await the stream's terminal outcome: `Ok` for a clean close, the
    /// recorded error otherwise. Every caller (and every repeated call)
    /// settles on the same outcome.
    pub async fn join(&self) -> Result<()> {
        let mut terminal = self.inner.terminal();
        loop {
            let settled = terminal.borrow_and_update().clone();
            if let Some(result) = settled {
                return result;
            }
            if terminal.changed().await.is_err() {
                return Err(LinkError::StreamClosed(self.inner.id().to_string()));
            }
        }
    }

    /// Unregister and settle `join()`: cleanly with `None`, rejecting with
    /// the supplied error otherwise. Idempotent; the first close decides
    /// the outcome.
    pub async fn close(&self, error: Option<LinkError>) {
        match self.mux.upgrade() {
            Some(mux) => mux.close_stream(&self.inner, error).await,
            None => self.inner.settle(match error {
                Some(e) => Err(e),
                None => Ok(()),
            }),
        }
    }
}
