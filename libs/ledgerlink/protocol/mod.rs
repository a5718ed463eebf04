//! Wire protocol codecs.
//!
//! The multiplexer is generic over a [`StreamProtocol`]: a codec that builds
//! outbound registration/stop frames and classifies inbound frames into
//! [`Inbound`] variants. Two protocols ship with the crate:
//!
//! - [`listen::ListenProtocol`]: the service's native JSON frames
//!   (`listen`/`unlisten`), resuming from an integer stream position
//! - [`graphql::GraphqlProtocol`]: GraphQL subscriptions over the
//!   `graphql-ws` sub-protocol (`connection_init`/`start`/`stop`), resuming
//!   from an opaque cursor

pub mod graphql;
pub mod listen;
pub mod marker;

pub use graphql::GraphqlProtocol;
pub use listen::ListenProtocol;
pub use marker::{MarkerKind, ResumeMarker};

use serde_json::Value;

use crate::error::Result;

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Payload for one registered stream, keyed by correlation id
    Payload { id: String, body: Value },
    /// Terminal error frame for one stream
    StreamError { id: String, body: Value },
    /// Server completed one stream cleanly
    Complete { id: String },
    /// Connection handshake accepted
    HandshakeAck,
    /// Connection handshake rejected
    HandshakeError { body: Value },
    /// Heartbeat frame, discarded before routing
    KeepAlive,
    /// Structurally valid frame that cannot be routed to a stream
    Unroutable { detail: String },
}

/// A wire protocol the multiplexer can speak.
///
/// Implementations are stateless codecs; everything session-scoped (the
/// registry, the handshake gate, markers) lives in the multiplexer and its
/// handles.
pub trait StreamProtocol: Send + Sync + 'static {
    /// Parameters a caller supplies when registering a stream.
    type Registration: Clone + Send + Sync + 'static;

    /// Marker shape this protocol resumes from.
    fn marker_kind(&self) -> MarkerKind;

    /// `Sec-WebSocket-Protocol` value to negotiate at connect, if any.
    fn sub_protocol(&self) -> Option<&'static str> {
        None
    }

    /// Whether a connection-scoped handshake must complete before any
    /// registration frame may be sent.
    fn requires_handshake(&self) -> bool {
        false
    }

    /// Handshake init frame carrying the current bearer token. `None` for
    /// protocols without a handshake.
    fn encode_handshake(&self, _token: Option<&str>) -> Option<String> {
        None
    }

    /// Registration frame for one stream, augmented with a resumption
    /// marker when one is in effect.
    fn encode_register(
        &self,
        id: &str,
        registration: &Self::Registration,
        marker: Option<&ResumeMarker>,
    ) -> Result<String>;

    /// Stop/unlisten frame for one stream.
    fn encode_stop(&self, id: &str) -> String;

    /// Classify one inbound text frame.
    fn decode(&self, raw: &str) -> Result<Inbound>;
}

/// Correlation ids arrive as strings or numbers depending on the server;
/// normalize both to the string form used by the registry.
pub(crate) fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
