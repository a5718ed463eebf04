//! Common test utilities for permasockets integration tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use permasockets::{PermaSocketError, SocketEventHandler, TerminationReason};

/// How the mock server treats each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    /// Echo text and binary frames back
    Echo,
    /// Close with a normal (1000) code right after the handshake
    NormalClose,
    /// Abnormally close (1011) the first `drops` connections, echo afterwards
    AbnormalThenEcho { drops: usize },
}

/// Scripted mock WebSocket server.
pub struct MockWsServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockWsServer {
    /// Start an echo server.
    pub async fn start() -> Self {
        Self::start_with(Behavior::Echo).await
    }

    /// Start a server with the given per-connection behavior.
    pub async fn start_with(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let accepted = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let shutdown_task = Arc::clone(&shutdown);
        let accepted_task = Arc::clone(&accepted);
        let received_task = Arc::clone(&received);
        let requests_task = Arc::clone(&requests);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let index = accepted_task.fetch_add(1, Ordering::SeqCst);
                                let shutdown = Arc::clone(&shutdown_task);
                                let received = Arc::clone(&received_task);
                                let requests = Arc::clone(&requests_task);
                                tokio::spawn(async move {
                                    handle_connection(
                                        stream, behavior, index, shutdown, received, requests,
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
            requests,
        }
    }

    /// Get the WebSocket URL for this server
    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Number of TCP connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Text frames received across all connections, in arrival order
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Request URIs seen at the WebSocket handshake, in arrival order
    pub fn request_uris(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// Shutdown the server; open connections are dropped without a close
    /// frame (clients see an abnormal end).
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(
    stream: TcpStream,
    behavior: Behavior,
    index: usize,
    shutdown: Arc<Notify>,
    received: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let requests_cb = Arc::clone(&requests);
    let callback = move |req: &Request, response: Response| {
        requests_cb.lock().push(req.uri().to_string());
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

    match behavior {
        Behavior::NormalClose => {
            let _ = write
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "done".into(),
                })))
                .await;
            // Drain until the client acks the close.
            while let Some(Ok(msg)) = read.next().await {
                if msg.is_close() {
                    break;
                }
            }
            return;
        }
        Behavior::AbnormalThenEcho { drops } if index < drops => {
            let _ = write
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Error,
                    reason: "scripted failure".into(),
                })))
                .await;
            return;
        }
        _ => {}
    }

    // Echo loop
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Message::Text(text) = &msg {
                            received.lock().push(text.clone());
                        }
                        if msg.is_text() || msg.is_binary() {
                            if write.send(msg).await.is_err() {
                                break;
                            }
                        } else if msg.is_ping() {
                            let pong = Message::Pong(msg.into_data());
                            if write.send(pong).await.is_err() {
                                break;
                            }
                        } else if msg.is_close() {
                            break;
                        }
                    }
                    Some(Err(_)) | None => break,
                }
            }
            _ = shutdown.notified() => {
                break;
            }
        }
    }
}

/// Event handler that records everything it sees.
#[derive(Default)]
pub struct RecordingEvents {
    pub frames: Mutex<Vec<String>>,
    pub reconnects: AtomicUsize,
    pub errors: AtomicUsize,
    pub terminations: Mutex<Vec<TerminationReason>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> Vec<TerminationReason> {
        self.terminations.lock().clone()
    }
}

#[async_trait]
impl SocketEventHandler for RecordingEvents {
    fn on_frame(&self, frame: String) {
        self.frames.lock().push(frame);
    }

    async fn on_reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_terminated(&self, reason: TerminationReason) {
        self.terminations.lock().push(reason);
    }

    fn on_error(&self, _error: &PermaSocketError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
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
