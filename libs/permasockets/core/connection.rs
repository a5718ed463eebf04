//! A resilient WebSocket connection.
//!
//! One `Connection` owns at most one physical socket. The public handle is
//! cheap to clone; `connect`/`disconnect`/`send` can be called from any task.
//! A spawned session task owns the read half for the whole session: it
//! delivers inbound frames to the registered [`SocketEventHandler`], sends
//! keep-alive frames, classifies closes, and redials abnormally closed
//! transports at a fixed delay until it succeeds or `disconnect()` is called.
//!
//! Concurrency contract:
//! - at most one dial in flight (`attempt` guard); a `connect()` that finds
//!   the state `Connecting` suspends on the state cell and joins the attempt
//! - at most one teardown in flight (`disconnect_gate`); `disconnect()`
//!   resolves only after the session task has fully exited
//! - the write half sits behind an async mutex so the send path never goes
//!   through the session task (event handlers may send from inside callbacks)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::core::config::ConnectionConfig;
use crate::core::connection_state::{
    AtomicSocketMetrics, ConnectionState, SocketMetrics, StateCell,
};
use crate::core::url::compose_token_url;
use crate::traits::{PermaSocketError, Result, SocketEventHandler, TerminationReason};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type FrameSink = SplitSink<WsStream, Message>;
type FrameSource = SplitStream<WsStream>;

/// Explicit-disconnect signal shared with the session task.
#[derive(Debug, Default)]
struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn request(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves once a disconnect has been requested.
    async fn requested(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

/// Everything the session task needs, cloned out of the handle so the task
/// never holds the handle itself (dropping the last `Connection` aborts the
/// task instead of leaking it).
#[derive(Clone)]
struct SessionContext {
    config: ConnectionConfig,
    token: Arc<RwLock<Option<String>>>,
    state: Arc<StateCell>,
    writer: Arc<Mutex<Option<FrameSink>>>,
    events: Arc<dyn SocketEventHandler>,
    shutdown: Arc<Shutdown>,
    metrics: Arc<AtomicSocketMetrics>,
}

struct ConnectionInner {
    config: ConnectionConfig,
    token: Arc<RwLock<Option<String>>>,
    state: Arc<StateCell>,
    writer: Arc<Mutex<Option<FrameSink>>>,
    events: RwLock<Option<Arc<dyn SocketEventHandler>>>,
    shutdown: Arc<Shutdown>,
    metrics: Arc<AtomicSocketMetrics>,
    /// Serializes dials so two callers can never open two transports
    attempt: Mutex<()>,
    /// Serializes teardowns so concurrent disconnects share one
    disconnect_gate: Mutex<()>,
    session: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(handle) = self.session.get_mut().take() {
            handle.abort();
        }
    }
}

/// Resilient WebSocket connection handle.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                token: Arc::new(RwLock::new(None)),
                state: Arc::new(StateCell::default()),
                writer: Arc::new(Mutex::new(None)),
                events: RwLock::new(None),
                shutdown: Arc::new(Shutdown::default()),
                metrics: Arc::new(AtomicSocketMetrics::new()),
                attempt: Mutex::new(()),
                disconnect_gate: Mutex::new(()),
                session: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn metrics(&self) -> SocketMetrics {
        self.inner.metrics.snapshot(self.state())
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Store the bearer token used to build the connect URL. Takes effect on
    /// the next dial; an open transport is left alone.
    pub fn set_api_token(&self, token: impl Into<String>) {
        *self.inner.token.write() = Some(token.into());
    }

    /// The token the next dial will use, if any.
    pub fn api_token(&self) -> Option<String> {
        self.inner.token.read().clone()
    }

    /// Open the connection, registering `events` as the lifecycle observer
    /// for this and every later session.
    ///
    /// Idempotent: already connected is a no-op, and a call that lands while
    /// another is dialing waits for that attempt instead of starting its own.
    /// An initial dial failure is returned to the caller directly; the
    /// reconnection policy only governs transports that were already open.
    pub async fn connect(&self, events: Arc<dyn SocketEventHandler>) -> Result<()> {
        *self.inner.events.write() = Some(events);
        self.connect_or_join().await
    }

    /// Close the connection and stop any redialing.
    ///
    /// Resolves only after the session task has processed the close and
    /// fully stopped, so keep-alive timers are gone and the state is
    /// `Disconnected` when this returns. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let _gate = self.inner.disconnect_gate.lock().await;

        let handle = self.inner.session.lock().take();
        let Some(handle) = handle else {
            // No session task. If an initial dial is racing us, flag it
            // down and wait for the state to settle; `Disconnected` must
            // hold by the time this returns.
            if self.inner.state.get() != ConnectionState::Disconnected {
                self.inner.shutdown.request();
                self.await_disconnected().await;
            }
            return Ok(());
        };

        self.inner.shutdown.request();
        {
            let mut guard = self.inner.writer.lock().await;
            if let Some(sink) = guard.as_mut() {
                let _ = sink.close().await;
            }
        }
        let _ = handle.await;
        Ok(())
    }

    /// Send a text frame. An explicit connect-or-reuse step precedes the
    /// write: if the connection is down and the reconnection policy allows
    /// it, this dials first; otherwise it fails with a socket error.
    pub async fn send(&self, frame: impl Into<String>) -> Result<()> {
        self.ensure_connected().await?;
        write_frame(&self.inner.writer, &self.inner.metrics, Message::Text(frame.into())).await
    }

    /// Send a text frame on the currently open transport, or fail.
    ///
    /// Unlike [`send`](Connection::send) this never dials and never waits
    /// out a redial: the frame goes onto the transport that was open when
    /// the call began, or nowhere. A down connection, and a transport that
    /// a redial replaced while the writer lock was contended, both return
    /// `NotConnected`.
    pub async fn try_send(&self, frame: impl Into<String>) -> Result<()> {
        if !self.is_connected() {
            return Err(PermaSocketError::NotConnected(
                "transport is not open".into(),
            ));
        }
        let generation = self.inner.metrics.reconnect_count();
        let mut guard = self.inner.writer.lock().await;
        // Re-checked under the writer lock: the reconnect count moves
        // before the state does, so an unchanged pair pins the sink to the
        // transport observed above.
        if !self.is_connected() || self.inner.metrics.reconnect_count() != generation {
            return Err(PermaSocketError::NotConnected(
                "transport changed underneath the send".into(),
            ));
        }
        match guard.as_mut() {
            Some(sink) => {
                sink.send(Message::Text(frame.into()))
                    .await
                    .map_err(|e| PermaSocketError::Transport(format!("send failed: {}", e)))?;
                self.inner.metrics.record_sent();
                Ok(())
            }
            None => Err(PermaSocketError::NotConnected("no open transport".into())),
        }
    }

    /// Connect-or-reuse without registering a new event handler. Used by the
    /// send path; explicit `connect()` is the only way to dial when the
    /// reconnection policy is disabled.
    async fn ensure_connected(&self) -> Result<()> {
        loop {
            match self.inner.state.get() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => self.await_settled().await?,
                ConnectionState::Disconnected => {
                    if !self.inner.config.reconnect.enabled {
                        return Err(PermaSocketError::NotConnected(
                            "not connected and reconnection is disabled".into(),
                        ));
                    }
                    return self.connect_or_join().await;
                }
            }
        }
    }

    async fn connect_or_join(&self) -> Result<()> {
        loop {
            match self.inner.state.get() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => self.await_settled().await?,
                ConnectionState::Disconnected => {
                    let _guard = self.inner.attempt.lock().await;
                    // Re-check: another caller may have dialed while we
                    // waited for the guard.
                    match self.inner.state.get() {
                        ConnectionState::Connected => return Ok(()),
                        ConnectionState::Connecting => continue,
                        ConnectionState::Disconnected => return self.start_session().await,
                    }
                }
            }
        }
    }

    /// Wait until the state cell reads `Disconnected`.
    async fn await_disconnected(&self) {
        let mut rx = self.inner.state.subscribe();
        while *rx.borrow_and_update() != ConnectionState::Disconnected {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for an in-flight attempt to settle. `Ok` means the state moved
    /// on (re-check it); `Err` means the attempt died without connecting.
    async fn await_settled(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    return Err(PermaSocketError::ConnectionClosed(
                        "connection attempt did not complete".into(),
                    ))
                }
                ConnectionState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(PermaSocketError::InvalidState("state cell dropped".into()));
            }
        }
    }

    /// Dial and spawn the session task. Caller holds the attempt guard and
    /// has verified the state is `Disconnected`.
    async fn start_session(&self) -> Result<()> {
        let events = self.inner.events.read().clone().ok_or_else(|| {
            PermaSocketError::InvalidState(
                "no event handler registered; call connect() first".into(),
            )
        })?;

        // A finished session may still be parked here.
        if let Some(old) = self.inner.session.lock().take() {
            old.abort();
        }
        self.inner.shutdown.clear();
        self.inner.state.set(ConnectionState::Connecting);

        let ctx = SessionContext {
            config: self.inner.config.clone(),
            token: Arc::clone(&self.inner.token),
            state: Arc::clone(&self.inner.state),
            writer: Arc::clone(&self.inner.writer),
            events,
            shutdown: Arc::clone(&self.inner.shutdown),
            metrics: Arc::clone(&self.inner.metrics),
        };

        // A disconnect that lands mid-dial finds no session task to signal,
        // so the dial itself must watch the shutdown flag.
        let dialed = tokio::select! {
            _ = ctx.shutdown.requested() => {
                Err(PermaSocketError::ShutDown(
                    "disconnect requested during dial".into(),
                ))
            }
            dialed = dial(&ctx) => dialed,
        };

        match dialed {
            Ok((sink, reader)) => {
                *self.inner.writer.lock().await = Some(sink);
                self.inner.state.set(ConnectionState::Connected);
                info!("Connected to {}", ctx.config.url);
                let handle = tokio::spawn(run_session(ctx, reader));
                *self.inner.session.lock() = Some(handle);
                Ok(())
            }
            Err(e @ PermaSocketError::ShutDown(_)) => {
                self.inner.state.set(ConnectionState::Disconnected);
                info!("Dial abandoned: {}", e);
                Err(e)
            }
            Err(e) => {
                self.inner.state.set(ConnectionState::Disconnected);
                error!("Failed to connect to {}: {}", ctx.config.url, e);
                ctx.events.on_error(&e);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

/// Open the transport. The URL is rebuilt from the base URL and the current
/// token on every call, so a token rotated between attempts is honored.
async fn dial(ctx: &SessionContext) -> Result<(FrameSink, FrameSource)> {
    let token = ctx.token.read().clone();
    let url = compose_token_url(&ctx.config.url, token.as_deref());

    let connected = match &ctx.config.sub_protocol {
        Some(proto) => {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| PermaSocketError::InvalidUrl(e.to_string()))?;
            let value = HeaderValue::from_str(proto)
                .map_err(|e| PermaSocketError::InvalidUrl(format!("bad sub-protocol: {}", e)))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            connect_async(request).await
        }
        None => connect_async(url.as_str()).await,
    };

    let (stream, _response) =
        connected.map_err(|e| PermaSocketError::Transport(format!("connect failed: {}", e)))?;
    Ok(stream.split())
}

async fn write_frame(
    writer: &Mutex<Option<FrameSink>>,
    metrics: &AtomicSocketMetrics,
    msg: Message,
) -> Result<()> {
    let mut guard = writer.lock().await;
    match guard.as_mut() {
        Some(sink) => {
            sink.send(msg)
                .await
                .map_err(|e| PermaSocketError::Transport(format!("send failed: {}", e)))?;
            metrics.record_sent();
            Ok(())
        }
        None => Err(PermaSocketError::NotConnected("no open transport".into())),
    }
}

/// How one connected stretch of the session ended.
enum SegmentEnd {
    /// Session is over; no redialing
    Terminal(TerminationReason),
    /// Transport died underneath us; the reconnection policy decides
    Abnormal(PermaSocketError),
}

/// Session task: owns the read half from first open to terminal close.
async fn run_session(ctx: SessionContext, mut reader: FrameSource) {
    loop {
        let end = run_segment(&ctx, &mut reader).await;
        match end {
            SegmentEnd::Terminal(reason) => {
                finish_session(&ctx, reason).await;
                return;
            }
            SegmentEnd::Abnormal(err) => {
                ctx.state.set(ConnectionState::Connecting);
                warn!("Connection lost: {}", err);
                ctx.events.on_error(&err);

                if !ctx.config.reconnect.enabled {
                    finish_session(
                        &ctx,
                        TerminationReason::Failed {
                            message: err.to_string(),
                        },
                    )
                    .await;
                    return;
                }

                match redial_loop(&ctx).await {
                    Some(new_reader) => reader = new_reader,
                    None => {
                        finish_session(&ctx, TerminationReason::LocalDisconnect).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Read frames and drive the keep-alive timer until the transport ends.
async fn run_segment(ctx: &SessionContext, reader: &mut FrameSource) -> SegmentEnd {
    let mut keep_alive = ctx.config.keep_alive.as_ref().map(|ka| {
        let mut ticker = interval_at(Instant::now() + ka.interval, ka.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        (ticker, ka.frame.clone())
    });

    loop {
        tokio::select! {
            _ = ctx.shutdown.requested() => {
                return SegmentEnd::Terminal(TerminationReason::LocalDisconnect);
            }

            _ = async {
                match keep_alive.as_mut() {
                    Some((ticker, _)) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending().await,
                }
            } => {
                if let Some((_, frame)) = keep_alive.as_ref() {
                    debug!("Sending keep-alive frame");
                    if let Err(e) =
                        write_frame(&ctx.writer, &ctx.metrics, Message::Text(frame.clone())).await
                    {
                        return SegmentEnd::Abnormal(e);
                    }
                }
            }

            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        ctx.metrics.record_received();
                        ctx.events.on_frame(text);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        ctx.metrics.record_received();
                        debug!("Ignoring {} byte binary frame", data.len());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) =
                            write_frame(&ctx.writer, &ctx.metrics, Message::Pong(payload)).await
                        {
                            return SegmentEnd::Abnormal(e);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Pong received");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return classify_close(ctx.shutdown.is_requested(), frame);
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        if ctx.shutdown.is_requested() {
                            return SegmentEnd::Terminal(TerminationReason::LocalDisconnect);
                        }
                        return SegmentEnd::Abnormal(PermaSocketError::Transport(e.to_string()));
                    }
                    None => {
                        if ctx.shutdown.is_requested() {
                            return SegmentEnd::Terminal(TerminationReason::LocalDisconnect);
                        }
                        return SegmentEnd::Abnormal(PermaSocketError::ConnectionClosed(
                            "stream ended without close frame".into(),
                        ));
                    }
                }
            }
        }
    }
}

/// Normal and no-status closes are terminal; everything else is abnormal and
/// goes to the reconnection policy.
fn classify_close(local_disconnect: bool, frame: Option<CloseFrame<'_>>) -> SegmentEnd {
    if local_disconnect {
        return SegmentEnd::Terminal(TerminationReason::LocalDisconnect);
    }
    match frame {
        None => SegmentEnd::Terminal(TerminationReason::RemoteClose {
            code: 1005,
            reason: String::new(),
        }),
        Some(frame) => {
            let code = u16::from(frame.code);
            match frame.code {
                CloseCode::Normal | CloseCode::Status => SegmentEnd::Terminal(
                    TerminationReason::RemoteClose {
                        code,
                        reason: frame.reason.into_owned(),
                    },
                ),
                _ => SegmentEnd::Abnormal(PermaSocketError::ConnectionClosed(format!(
                    "abnormal close code {}: {}",
                    code, frame.reason
                ))),
            }
        }
    }
}

/// Redial at the fixed delay until it works or a disconnect is requested.
/// Returns the new read half, or `None` when the session should stop.
async fn redial_loop(ctx: &SessionContext) -> Option<FrameSource> {
    let delay = ctx.config.reconnect.delay;
    loop {
        debug!("Redialing in {:?}", delay);
        tokio::select! {
            _ = ctx.shutdown.requested() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match dial(ctx).await {
            Ok((sink, reader)) => {
                *ctx.writer.lock().await = Some(sink);
                // Counted before the state flips so `try_send` can pin a
                // frame to the transport generation it observed.
                ctx.metrics.record_reconnect();
                ctx.state.set(ConnectionState::Connected);
                info!("Reconnected to {}", ctx.config.url);
                // Writer is live before the observer runs, so handlers may
                // send frames from inside the callback.
                ctx.events.on_reconnected().await;
                return Some(reader);
            }
            Err(e) => {
                warn!("Redial failed: {}", e);
                ctx.events.on_error(&e);
            }
        }
    }
}

async fn finish_session(ctx: &SessionContext, reason: TerminationReason) {
    *ctx.writer.lock().await = None;
    ctx.state.set(ConnectionState::Disconnected);
    info!("Session ended: {}", reason);
    ctx.events.on_terminated(reason);
}
