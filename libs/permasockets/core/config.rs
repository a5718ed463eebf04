use std::time::Duration;

/// Default wait between redial attempts after an abnormal close.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Reconnection policy for a connection.
///
/// Reconnection here is deliberately simple: a fixed delay between attempts
/// and no attempt cap. An abnormally closed connection keeps redialing until
/// it succeeds or `disconnect()` is called.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Whether abnormal closes trigger redialing at all
    pub enabled: bool,

    /// Fixed wait between redial attempts
    pub delay: Duration,
}

impl ReconnectPolicy {
    /// Redial forever with the given fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self { enabled: true, delay }
    }

    /// Never redial: any close, normal or not, ends the session.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

/// Periodic client-side heartbeat.
///
/// The frame is sent verbatim every `interval` while the connection is open.
/// The timer restarts on every (re)connection and stops with the session.
#[derive(Debug, Clone, PartialEq)]
pub struct KeepAlive {
    /// Interval between heartbeat frames
    pub interval: Duration,

    /// Text frame sent as the heartbeat
    pub frame: String,
}

impl KeepAlive {
    pub fn new(interval: Duration, frame: impl Into<String>) -> Self {
        Self {
            interval,
            frame: frame.into(),
        }
    }
}

/// Configuration for a [`Connection`](crate::core::connection::Connection).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL (wss:// or ws://), without the token query parameter
    pub url: String,

    /// Redial behavior after abnormal closes
    pub reconnect: ReconnectPolicy,

    /// Optional periodic heartbeat
    pub keep_alive: Option<KeepAlive>,

    /// Optional `Sec-WebSocket-Protocol` value sent with the upgrade request
    pub sub_protocol: Option<String>,
}

impl ConnectionConfig {
    /// Config with default reconnection, no heartbeat, no sub-protocol.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            keep_alive: None,
            sub_protocol: None,
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn with_sub_protocol(mut self, proto: impl Into<String>) -> Self {
        self.sub_protocol = Some(proto.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn has_keep_alive(&self) -> bool {
        self.keep_alive.is_some()
    }
}
