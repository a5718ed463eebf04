//! Stream multiplexer: many logical streams over one resilient connection.
//!
//! The mux owns the registry that maps correlation ids to handles, drives
//! the connection lazily (first registration dials, optionally the last
//! unregistration hangs up), and reacts to connection lifecycle events:
//! restarting every stream after a reconnect, isolating per-stream server
//! errors, and settling all `join()` futures on terminal closure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use permasockets::{Connection, PermaSocketError, SocketEventHandler, TerminationReason};

use crate::error::{LinkError, Result};
use crate::protocol::marker::ResumeMarker;
use crate::protocol::{Inbound, StreamProtocol};
use crate::stream::handle::{HandleInner, StreamHandle};
use crate::stream::handshake::{HandshakeGate, HandshakeTicket, HandshakeWaiter};
use crate::stream::metrics::{StreamMetrics, StreamStats};

/// Multiplexer behavior knobs.
#[derive(Debug, Clone)]
pub struct MuxOptions {
    /// Restart every registered stream after each successful reconnect.
    pub restart_on_reconnect: bool,
    /// On a terminal per-stream error frame: `Some(delay)` restarts that
    /// stream after the delay, `None` closes it with the error attached.
    pub restart_on_error: Option<Duration>,
    /// Disconnect the connection when the last stream unregisters.
    pub auto_disconnect: bool,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            restart_on_reconnect: true,
            restart_on_error: None,
            auto_disconnect: true,
        }
    }
}

impl MuxOptions {
    pub fn with_restart_on_reconnect(mut self, enabled: bool) -> Self {
        self.restart_on_reconnect = enabled;
        self
    }

    pub fn with_restart_on_error(mut self, delay: Duration) -> Self {
        self.restart_on_error = Some(delay);
        self
    }

    pub fn with_auto_disconnect(mut self, enabled: bool) -> Self {
        self.auto_disconnect = enabled;
        self
    }
}

pub(crate) struct MuxCore<P: StreamProtocol> {
    connection: Connection,
    protocol: P,
    options: MuxOptions,
    registry: Mutex<HashMap<String, Arc<HandleInner<P>>>>,
    gate: HandshakeGate,
    metrics: StreamMetrics,
    // Bumped per reconnect; a restart cycle that was overtaken by a newer
    // one bails out instead of double-registering every stream.
    restart_epoch: AtomicU64,
    self_weak: Weak<MuxCore<P>>,
}

/// Multiplexer over one [`Connection`], generic over the wire protocol.
///
/// Delivery order within a single handle matches transport order. There is
/// no ordering guarantee across different handles sharing the connection.
pub struct StreamMux<P: StreamProtocol> {
    core: Arc<MuxCore<P>>,
}

impl<P: StreamProtocol> Clone for StreamMux<P> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<P: StreamProtocol> StreamMux<P> {
    /// Build a mux over an explicitly owned connection. The connection's
    /// event handler is claimed on the first registration.
    pub fn new(connection: Connection, protocol: P, options: MuxOptions) -> Self {
        let core = Arc::new_cyclic(|weak| MuxCore {
            connection,
            protocol,
            options,
            registry: Mutex::new(HashMap::new()),
            gate: HandshakeGate::new(),
            metrics: StreamMetrics::new(),
            restart_epoch: AtomicU64::new(0),
            self_weak: weak.clone(),
        });
        Self { core }
    }

    /// Register a stream under a caller-chosen correlation id.
    ///
    /// Connects (and completes the handshake) if needed, inserts the handle
    /// into the registry, then sends the registration frame; insertion comes
    /// first so a reply arriving right after the send already finds its
    /// handle. Returns once the frame is sent, not when the server
    /// acknowledges. `on_message` runs on the connection's session task, in
    /// transport order, for every frame carrying this id.
    pub async fn register_stream<F>(
        &self,
        id: impl Into<String>,
        registration: P::Registration,
        on_message: F,
    ) -> Result<StreamHandle<P>>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = id.into();
        self.ensure_session().await?;

        let inner = Arc::new(HandleInner::new(
            id.clone(),
            registration,
            self.core.protocol.marker_kind(),
            Box::new(on_message),
        ));
        let frame = self
            .core
            .protocol
            .encode_register(&id, inner.registration(), None)?;

        {
            let mut registry = self.core.registry.lock();
            if registry.contains_key(&id) {
                return Err(LinkError::DuplicateStream(id));
            }
            registry.insert(id.clone(), inner.clone());
        }

        debug!("Registering stream '{}'", id);
        if let Err(e) = self.core.connection.send(frame).await {
            let mut registry = self.core.registry.lock();
            if registry
                .get(&id)
                .map_or(false, |current| Arc::ptr_eq(current, &inner))
            {
                registry.remove(&id);
            }
            return Err(e.into());
        }

        Ok(StreamHandle::new(inner, self.core.self_weak.clone()))
    }

    /// Unregister a stream by id. Unknown ids are a silent no-op: no frames
    /// go out and no error is raised. For a registered stream this sends the
    /// stop frame (best effort), settles its `join()` cleanly, and
    /// disconnects if the registry emptied and auto-disconnect is on.
    pub async fn unregister_stream(&self, id: &str) {
        let handle = self.core.registry.lock().get(id).cloned();
        match handle {
            Some(handle) => self.core.close_stream(&handle, None).await,
            None => debug!("Unregister for unknown stream '{}'", id),
        }
    }

    /// Close every stream cleanly, then disconnect the connection.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.core.registry.lock().values().cloned().collect();
        for handle in handles {
            self.core.close_stream(&handle, None).await;
        }
        if let Err(e) = self.core.connection.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.core.connection
    }

    /// Ids of all currently registered streams.
    pub fn stream_ids(&self) -> Vec<String> {
        self.core.registry.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.core.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.registry.lock().is_empty()
    }

    pub fn metrics(&self) -> StreamStats {
        self.core.metrics.snapshot(self.len())
    }

    /// Whether the protocol handshake is established on the live transport.
    pub fn handshake_ready(&self) -> bool {
        self.core.gate.is_ready()
    }

    async fn ensure_session(&self) -> Result<()> {
        let events: Arc<dyn SocketEventHandler> = Arc::new(MuxEvents {
            core: Arc::downgrade(&self.core),
        });
        self.core.connection.connect(events).await?;
        self.core.ensure_handshake().await
    }
}

impl<P: StreamProtocol> MuxCore<P> {
    async fn ensure_handshake(&self) -> Result<()> {
        if !self.protocol.requires_handshake() {
            return Ok(());
        }
        match self.gate.ticket() {
            HandshakeTicket::Ready => Ok(()),
            HandshakeTicket::Join(waiter) => waiter.outcome().await,
            HandshakeTicket::Lead(waiter) => self.lead_handshake(waiter).await,
        }
    }

    /// Send the init frame and await the shared outcome. Must not run on
    /// the session task: the acknowledgement arrives through it.
    async fn lead_handshake(&self, waiter: HandshakeWaiter) -> Result<()> {
        let token = self.connection.api_token();
        let frame = match self.protocol.encode_handshake(token.as_deref()) {
            Some(frame) => frame,
            None => {
                let e = LinkError::Encode(
                    "protocol requires a handshake but produced no init frame".into(),
                );
                self.gate.resolve(Err(e.clone()));
                return Err(e);
            }
        };
        debug!("Sending handshake init");
        // Pinned to the live transport: an init frame that queued across a
        // redial would double up with the next cycle's re-lead.
        if let Err(e) = self.connection.try_send(frame).await {
            let e = LinkError::from(e);
            self.gate.resolve(Err(e.clone()));
            return Err(e);
        }
        waiter.outcome().await
    }

    /// Re-send a stream's registration frame, augmented with the effective
    /// marker (explicit over stored over none).
    ///
    /// The frame goes onto the transport that is open right now or not at
    /// all: a restart must never queue across a redial and land next to the
    /// replacement cycle's own restart.
    pub(crate) async fn restart_handle(
        &self,
        handle: &Arc<HandleInner<P>>,
        explicit: Option<ResumeMarker>,
    ) -> Result<()> {
        {
            let registry = self.registry.lock();
            match registry.get(handle.id()) {
                Some(current) if Arc::ptr_eq(current, handle) => {}
                _ => return Err(LinkError::StreamClosed(handle.id().to_string())),
            }
        }
        self.ensure_handshake().await?;

        let marker = explicit.or_else(|| handle.marker());
        let frame = self
            .protocol
            .encode_register(handle.id(), handle.registration(), marker.as_ref())?;
        debug!("Restarting stream '{}'", handle.id());
        self.connection.try_send(frame).await?;

        handle.set_active(true);
        self.metrics.record_restart();
        handle.run_post_restart();
        Ok(())
    }

    /// Remove a stream from the registry, send its stop frame while
    /// connected, and settle its terminal cell. Safe to call repeatedly.
    pub(crate) async fn close_stream(
        &self,
        handle: &Arc<HandleInner<P>>,
        error: Option<LinkError>,
    ) {
        let removed = {
            let mut registry = self.registry.lock();
            match registry.get(handle.id()) {
                Some(current) if Arc::ptr_eq(current, handle) => {
                    registry.remove(handle.id()).is_some()
                }
                _ => false,
            }
        };
        if removed {
            debug!("Closing stream '{}'", handle.id());
            handle.set_active(false);
            if self.connection.is_connected() {
                let frame = self.protocol.encode_stop(handle.id());
                if let Err(e) = self.connection.try_send(frame).await {
                    warn!("Stop frame for stream '{}' failed: {}", handle.id(), e);
                }
            }
        }
        handle.settle(match error {
            Some(e) => Err(e),
            None => Ok(()),
        });
        if removed {
            self.maybe_auto_disconnect();
        }
    }

    fn handle_frame(&self, frame: String) {
        let inbound = match self.protocol.decode(&frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.metrics.record_dropped();
                debug!("Undecodable frame dropped: {}", e);
                return;
            }
        };
        match inbound {
            Inbound::KeepAlive => {}
            Inbound::HandshakeAck => {
                debug!("Handshake acknowledged");
                self.gate.resolve(Ok(()));
            }
            Inbound::HandshakeError { body } => {
                warn!("Handshake rejected: {}", body);
                self.gate
                    .resolve(Err(LinkError::HandshakeRejected { payload: body }));
                self.spawn_disconnect();
            }
            Inbound::Payload { id, body } => {
                let handle = self.registry.lock().get(&id).cloned();
                match handle {
                    Some(handle) => {
                        self.metrics.record_routed();
                        handle.deliver(body);
                    }
                    None => {
                        self.metrics.record_dropped();
                        debug!("Dropping frame for unknown stream '{}'", id);
                    }
                }
            }
            Inbound::StreamError { id, body } => self.handle_stream_error(id, body),
            Inbound::Complete { id } => self.handle_complete(id),
            Inbound::Unroutable { detail } => {
                self.metrics.record_dropped();
                debug!("Dropping unroutable frame: {}", detail);
            }
        }
    }

    /// Terminal error frame for one stream: restart it after the configured
    /// delay, or close it with the error attached.
    fn handle_stream_error(&self, id: String, body: Value) {
        let handle = match self.registry.lock().get(&id).cloned() {
            Some(handle) => handle,
            None => {
                self.metrics.record_dropped();
                debug!("Error frame for unknown stream '{}'", id);
                return;
            }
        };
        let stream_error = LinkError::StreamFailed {
            id: id.clone(),
            payload: body,
        };
        match self.options.restart_on_error {
            Some(delay) => {
                warn!("Stream '{}' failed, restarting in {:?}: {}", id, delay, stream_error);
                handle.set_active(false);
                let weak = self.self_weak.clone();
                let epoch = self.restart_epoch.load(Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let core = match weak.upgrade() {
                        Some(core) => core,
                        None => return,
                    };
                    // A reconnect during the delay hands the stream to that
                    // transport's restart cycle; an active handle was
                    // already re-registered by other means.
                    if core.restart_epoch.load(Ordering::SeqCst) != epoch
                        || handle.is_active()
                    {
                        debug!("Skipping delayed restart of stream '{}'", handle.id());
                        return;
                    }
                    if !core.connection.is_connected() {
                        debug!(
                            "Skipping delayed restart of stream '{}': transport down",
                            handle.id()
                        );
                        return;
                    }
                    if let Err(e) = core.restart_handle(&handle, None).await {
                        warn!("Restart of stream '{}' failed: {}", handle.id(), e);
                    }
                });
            }
            None => {
                warn!("Stream '{}' failed: {}", id, stream_error);
                let removed = {
                    let mut registry = self.registry.lock();
                    match registry.get(&id) {
                        Some(current) if Arc::ptr_eq(current, &handle) => {
                            registry.remove(&id).is_some()
                        }
                        _ => false,
                    }
                };
                if removed {
                    handle.set_active(false);
                    handle.settle(Err(stream_error));
                    self.maybe_auto_disconnect();
                }
            }
        }
    }

    /// Server finished one stream cleanly.
    fn handle_complete(&self, id: String) {
        let removed = self.registry.lock().remove(&id);
        match removed {
            Some(handle) => {
                info!("Stream '{}' complete", id);
                handle.set_active(false);
                handle.settle(Ok(()));
                self.maybe_auto_disconnect();
            }
            None => {
                self.metrics.record_dropped();
                debug!("Complete frame for unknown stream '{}'", id);
            }
        }
    }

    /// Post-reconnect recovery: re-handshake where required, then re-send
    /// every registration exactly once. Runs as its own task so the session
    /// task is free to deliver the handshake acknowledgement.
    async fn run_restart_cycle(&self, epoch: u64) {
        if self.protocol.requires_handshake() {
            let outcome = match self.gate.reopen() {
                Some(waiter) => self.lead_handshake(waiter).await,
                // A registration already leads on this transport.
                None => self.ensure_handshake().await,
            };
            match outcome {
                Ok(()) => {}
                Err(LinkError::Socket(e)) => {
                    // Transport died again; the next reconnect cycle retries.
                    warn!("Handshake send failed after reconnect: {}", e);
                    return;
                }
                Err(e) => {
                    error!("Handshake rejected after reconnect: {}", e);
                    self.fail_all(e);
                    self.spawn_disconnect();
                    return;
                }
            }
        }
        if self.restart_epoch.load(Ordering::SeqCst) != epoch {
            debug!("Restart cycle superseded by a newer reconnect");
            return;
        }
        let handles: Vec<_> = self.registry.lock().values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        info!("Restarting {} stream(s) after reconnect", handles.len());
        for handle in handles {
            // Both re-checked per stream: the transport can die again in the
            // middle of the loop, and each registration belongs to exactly
            // one cycle.
            if self.restart_epoch.load(Ordering::SeqCst) != epoch {
                debug!("Restart cycle superseded by a newer reconnect");
                return;
            }
            if handle.is_active() {
                debug!("Stream '{}' already live on this transport", handle.id());
                continue;
            }
            match self.restart_handle(&handle, None).await {
                Ok(()) => {}
                Err(LinkError::Socket(e)) => {
                    // The rest of the registry stays inactive for the next
                    // cycle to pick up.
                    warn!("Restart cycle interrupted: {}", e);
                    return;
                }
                Err(e) => {
                    warn!("Restart of stream '{}' after reconnect failed: {}", handle.id(), e);
                }
            }
        }
    }

    /// Settle every registered stream with `error` and clear the registry.
    fn fail_all(&self, error: LinkError) {
        let drained: Vec<_> = {
            let mut registry = self.registry.lock();
            registry.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drained {
            handle.set_active(false);
            handle.settle(Err(error.clone()));
        }
    }

    fn maybe_auto_disconnect(&self) {
        if !self.options.auto_disconnect {
            return;
        }
        if !self.registry.lock().is_empty() || !self.connection.is_connected() {
            return;
        }
        info!("No streams left; disconnecting");
        self.spawn_disconnect();
    }

    /// `disconnect()` awaits the session task, so it must never run on it.
    fn spawn_disconnect(&self) {
        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            if let Some(core) = weak.upgrade() {
                if let Err(e) = core.connection.disconnect().await {
                    warn!("Disconnect failed: {}", e);
                }
            }
        });
    }
}

impl<P: StreamProtocol> Drop for MuxCore<P> {
    fn drop(&mut self) {
        let drained: Vec<_> = self
            .registry
            .get_mut()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in drained {
            handle.set_active(false);
            handle.settle(Err(LinkError::Terminated("multiplexer dropped".into())));
        }
    }
}

/// The connection-facing event adapter. Holds the core weakly so the
/// connection (which stores its handler) never keeps a dropped mux alive.
struct MuxEvents<P: StreamProtocol> {
    core: Weak<MuxCore<P>>,
}

#[async_trait]
impl<P: StreamProtocol> SocketEventHandler for MuxEvents<P> {
    fn on_frame(&self, frame: String) {
        if let Some(core) = self.core.upgrade() {
            core.handle_frame(frame);
        }
    }

    async fn on_reconnected(&self) {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return,
        };
        if !core.options.restart_on_reconnect {
            debug!("Transport reopened; automatic restart disabled");
            return;
        }
        let epoch = core.restart_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = self.core.clone();
        tokio::spawn(async move {
            if let Some(core) = weak.upgrade() {
                core.run_restart_cycle(epoch).await;
            }
        });
    }

    fn on_terminated(&self, reason: TerminationReason) {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return,
        };
        info!("Session over: {}", reason);
        core.gate.reset();
        core.fail_all(LinkError::Terminated(reason.to_string()));
    }

    fn on_error(&self, error: &PermaSocketError) {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return,
        };
        warn!("Transport error: {}", error);
        core.gate.suspend();
        for handle in core.registry.lock().values() {
            handle.set_active(false);
        }
    }
}
