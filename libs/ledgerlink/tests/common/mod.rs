//! Common test utilities for ledgerlink integration tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// How a connection answers a `connection_init` frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandshakeMode {
    /// Plain protocol; an init frame would just be recorded
    Ignore,
    /// Reply with `connection_ack`
    Ack,
    /// Reply with `connection_error`
    Reject,
    /// Record the init and reply nothing until the test pushes a frame
    Manual,
}

struct ConnectionControls {
    outbox: UnboundedSender<String>,
    kick: Arc<Notify>,
}

/// Scripted mock server speaking newline-less JSON text frames.
///
/// Handshake behavior is scripted per accepted connection (the last entry
/// repeats). Tests inspect everything received and inject frames into the
/// live connection.
pub struct MockStreamServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    current: Arc<Mutex<Option<ConnectionControls>>>,
}

impl MockStreamServer {
    /// Start a server for the plain listen protocol.
    pub async fn start_plain() -> Self {
        Self::start(vec![HandshakeMode::Ignore]).await
    }

    /// Start a server with the given per-connection handshake script.
    pub async fn start(script: Vec<HandshakeMode>) -> Self {
        assert!(!script.is_empty(), "handshake script cannot be empty");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let accepted = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let current: Arc<Mutex<Option<ConnectionControls>>> = Arc::new(Mutex::new(None));

        let shutdown_task = Arc::clone(&shutdown);
        let accepted_task = Arc::clone(&accepted);
        let received_task = Arc::clone(&received);
        let current_task = Arc::clone(&current);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let index = accepted_task.fetch_add(1, Ordering::SeqCst);
                                let mode = script[index.min(script.len() - 1)];
                                let (outbox_tx, outbox_rx) = unbounded_channel();
                                let kick = Arc::new(Notify::new());
                                *current_task.lock() = Some(ConnectionControls {
                                    outbox: outbox_tx,
                                    kick: Arc::clone(&kick),
                                });
                                let shutdown = Arc::clone(&shutdown_task);
                                let received = Arc::clone(&received_task);
                                tokio::spawn(async move {
                                    handle_connection(
                                        stream, mode, outbox_rx, kick, shutdown, received,
                                    )
                                    .await;
                                });
                            }
                            Err(e) => {
                                eprintln!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_task.notified() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown,
            accepted,
            received,
            current,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Number of TCP connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Text frames received across all connections, in arrival order
    pub fn frames(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Received frames parsed as JSON and filtered to one `type`
    pub fn typed_frames(&self, frame_type: &str) -> Vec<Value> {
        self.frames()
            .iter()
            .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
            .filter(|value| value["type"] == frame_type)
            .collect()
    }

    /// Inject a frame into the live connection. `false` if none is up.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        match self.current.lock().as_ref() {
            Some(controls) => controls.outbox.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Drop the live connection without a close frame (clients observe an
    /// abnormal end and reconnect).
    pub fn drop_connection(&self) {
        if let Some(controls) = self.current.lock().as_ref() {
            controls.kick.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockStreamServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(
    stream: TcpStream,
    mode: HandshakeMode,
    mut outbox: UnboundedReceiver<String>,
    kick: Arc<Notify>,
    shutdown: Arc<Notify>,
    received: Arc<Mutex<Vec<String>>>,
) {
    // Answer a requested sub-protocol so protocol-negotiating clients are
    // happy.
    let callback = move |req: &Request, mut response: Response| {
        if let Some(proto) = req.headers().get("Sec-WebSocket-Protocol") {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", proto.clone());
        }
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        received.lock().push(text.clone());
                        let frame_type = serde_json::from_str::<Value>(&text)
                            .ok()
                            .and_then(|v| v["type"].as_str().map(str::to_owned));
                        if frame_type.as_deref() == Some("connection_init") {
                            let reply = match mode {
                                HandshakeMode::Ack => {
                                    Some(json!({"type": "connection_ack"}).to_string())
                                }
                                HandshakeMode::Reject => Some(
                                    json!({
                                        "type": "connection_error",
                                        "payload": {"message": "bad credentials"},
                                    })
                                    .to_string(),
                                ),
                                HandshakeMode::Ignore | HandshakeMode::Manual => None,
                            };
                            if let Some(reply) = reply {
                                if write.send(Message::Text(reply)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            frame = outbox.recv() => {
                match frame {
                    Some(frame) => {
                        if write.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = kick.notified() => {
                // Drain frames already on the wire so the raw drop does not
                // lose them, then drop without a close frame.
                let deadline = tokio::time::sleep(Duration::from_millis(25));
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => received.lock().push(text),
                            Some(Ok(_)) => {}
                            Some(Err(_)) | None => break,
                        },
                        _ = &mut deadline => break,
                    }
                }
                return;
            }
            _ = shutdown.notified() => {
                return;
            }
        }
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collects every payload routed to one handle.
#[derive(Default)]
pub struct Sink {
    payloads: Mutex<Vec<Value>>,
}

impl Sink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, payload: Value) {
        self.payloads.lock().push(payload);
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().len()
    }
}
