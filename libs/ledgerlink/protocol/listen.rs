//! Native listen protocol: JSON text frames with a `req_id` correlation id.
//!
//! Registration sends a `listen` frame; the optional `start_block` field
//! carries the resumption position (inclusive). The stop frame is
//! `unlisten`, and the client keep-alive is a bare `{"type":"pong"}`.

use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::protocol::marker::{MarkerKind, ResumeMarker};
use crate::protocol::{id_from_value, Inbound, StreamProtocol};

/// Client heartbeat frame for this protocol. Pair it with
/// [`KeepAlive`](permasockets::KeepAlive) on the connection config.
pub const KEEP_ALIVE_FRAME: &str = r#"{"type":"pong"}"#;

/// Registration parameters for one listen stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenRequest {
    /// Query document registered for live updates
    pub listen: Option<Value>,
    /// One-shot fetch evaluated alongside the listen
    pub fetch: Option<Value>,
    /// Initial stream position; a marker overrides this on restart
    pub start_block: Option<u64>,
    /// Ask the server to emit progress frames for this stream
    pub with_progress: bool,
    /// Request body forwarded verbatim
    pub data: Value,
}

impl ListenRequest {
    /// Live listen on a query document.
    pub fn listen(doc: Value) -> Self {
        Self {
            listen: Some(doc),
            fetch: None,
            start_block: None,
            with_progress: false,
            data: Value::Null,
        }
    }

    /// One-shot fetch of a query document.
    pub fn fetch(doc: Value) -> Self {
        Self {
            listen: None,
            fetch: Some(doc),
            start_block: None,
            with_progress: false,
            data: Value::Null,
        }
    }

    pub fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }

    pub fn with_progress(mut self) -> Self {
        self.with_progress = true;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Codec for the native listen protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenProtocol;

impl StreamProtocol for ListenProtocol {
    type Registration = ListenRequest;

    fn marker_kind(&self) -> MarkerKind {
        MarkerKind::Position
    }

    fn encode_register(
        &self,
        id: &str,
        registration: &Self::Registration,
        marker: Option<&ResumeMarker>,
    ) -> Result<String> {
        let mut frame = Map::new();
        frame.insert("type".into(), json!("listen"));
        frame.insert("req_id".into(), json!(id));
        if let Some(doc) = &registration.listen {
            frame.insert("listen".into(), doc.clone());
        }
        if let Some(doc) = &registration.fetch {
            frame.insert("fetch".into(), doc.clone());
        }
        let start_block = match marker {
            Some(ResumeMarker::Position(p)) => Some(*p),
            // A cursor can never reach this codec: markers are validated
            // against the protocol's kind where they are set.
            Some(ResumeMarker::Cursor(_)) => None,
            None => registration.start_block,
        };
        if let Some(block) = start_block {
            frame.insert("start_block".into(), json!(block));
        }
        if registration.with_progress {
            frame.insert("with_progress".into(), json!(true));
        }
        frame.insert("data".into(), registration.data.clone());
        Ok(Value::Object(frame).to_string())
    }

    fn encode_stop(&self, id: &str) -> String {
        json!({
            "type": "unlisten",
            "req_id": id,
            "data": { "req_id": id },
        })
        .to_string()
    }

    fn decode(&self, raw: &str) -> Result<Inbound> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| crate::error::LinkError::Decode(format!("invalid frame: {}", e)))?;
        let frame_type = match value.get("type").and_then(Value::as_str) {
            Some(t) => t.to_owned(),
            None => {
                return Ok(Inbound::Unroutable {
                    detail: "frame without type".into(),
                })
            }
        };

        if frame_type == "pong" || frame_type == "ping" {
            return Ok(Inbound::KeepAlive);
        }

        match value.get("req_id").and_then(id_from_value) {
            // Consumers see the whole frame: `type` distinguishes data from
            // progress and the other per-stream frame flavors.
            Some(id) => Ok(Inbound::Payload { id, body: value }),
            None => Ok(Inbound::Unroutable {
                detail: format!("'{}' frame without req_id", frame_type),
            }),
        }
    }
}
