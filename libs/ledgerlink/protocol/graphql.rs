//! GraphQL-over-WebSocket protocol: `connection_init` handshake, `start` /
//! `stop` stream frames, string cursors for resumption.
//!
//! The cursor rides inside the operation variables (`variables.cursor`), so
//! a restarted stream replays from wherever the consumer last marked.

use serde_json::{json, Map, Value};

use crate::error::{LinkError, Result};
use crate::protocol::marker::{MarkerKind, ResumeMarker};
use crate::protocol::{id_from_value, Inbound, StreamProtocol};

/// WebSocket sub-protocol announced during the upgrade.
pub const SUB_PROTOCOL: &str = "graphql-ws";

/// One GraphQL operation to run as a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphqlOperation {
    pub query: String,
    /// Operation variables; must be a JSON object (or null) so a resume
    /// cursor can be injected
    pub variables: Value,
}

impl GraphqlOperation {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: Value::Null,
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }
}

/// Codec for the GraphQL streaming protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphqlProtocol;

impl GraphqlProtocol {
    fn variables_with_cursor(
        variables: &Value,
        marker: Option<&ResumeMarker>,
    ) -> Result<Value> {
        let mut map = match variables {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(LinkError::Encode(format!(
                    "operation variables must be an object, got {}",
                    other
                )))
            }
        };
        if let Some(ResumeMarker::Cursor(cursor)) = marker {
            map.insert("cursor".into(), json!(cursor));
        }
        Ok(Value::Object(map))
    }
}

impl StreamProtocol for GraphqlProtocol {
    type Registration = GraphqlOperation;

    fn marker_kind(&self) -> MarkerKind {
        MarkerKind::Cursor
    }

    fn sub_protocol(&self) -> Option<&'static str> {
        Some(SUB_PROTOCOL)
    }

    fn requires_handshake(&self) -> bool {
        true
    }

    fn encode_handshake(&self, token: Option<&str>) -> Option<String> {
        let payload = match token {
            Some(token) => json!({ "Authorization": token }),
            None => json!({}),
        };
        Some(
            json!({
                "type": "connection_init",
                "payload": payload,
            })
            .to_string(),
        )
    }

    fn encode_register(
        &self,
        id: &str,
        registration: &Self::Registration,
        marker: Option<&ResumeMarker>,
    ) -> Result<String> {
        let variables = Self::variables_with_cursor(&registration.variables, marker)?;
        Ok(json!({
            "id": id,
            "type": "start",
            "payload": {
                "query": registration.query,
                "variables": variables,
            },
        })
        .to_string())
    }

    fn encode_stop(&self, id: &str) -> String {
        json!({ "id": id, "type": "stop" }).to_string()
    }

    fn decode(&self, raw: &str) -> Result<Inbound> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| LinkError::Decode(format!("invalid frame: {}", e)))?;
        let frame_type = match value.get("type").and_then(Value::as_str) {
            Some(t) => t.to_owned(),
            None => {
                return Ok(Inbound::Unroutable {
                    detail: "frame without type".into(),
                })
            }
        };
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);
        let id = value.get("id").and_then(id_from_value);

        let inbound = match frame_type.as_str() {
            "connection_ack" => Inbound::HandshakeAck,
            "connection_error" => Inbound::HandshakeError { body: payload },
            "ka" => Inbound::KeepAlive,
            "data" => match id {
                Some(id) => Inbound::Payload { id, body: payload },
                None => Inbound::Unroutable {
                    detail: "'data' frame without id".into(),
                },
            },
            "error" => match id {
                Some(id) => Inbound::StreamError { id, body: payload },
                None => Inbound::Unroutable {
                    detail: "'error' frame without id".into(),
                },
            },
            "complete" => match id {
                Some(id) => Inbound::Complete { id },
                None => Inbound::Unroutable {
                    detail: "'complete' frame without id".into(),
                },
            },
            other => Inbound::Unroutable {
                detail: format!("unknown frame type '{}'", other),
            },
        };
        Ok(inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_carries_token_verbatim() {
        let frame = GraphqlProtocol.encode_handshake(Some("tok-123")).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "connection_init");
        assert_eq!(value["payload"]["Authorization"], "tok-123");
    }

    #[test]
    fn handshake_without_token_sends_empty_payload() {
        let frame = GraphqlProtocol.encode_handshake(None).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["payload"], json!({}));
    }

    #[test]
    fn register_without_marker_leaves_variables_alone() {
        let op = GraphqlOperation::new("subscription { trades }")
            .with_variables(json!({"market": "BTC"}));
        let frame = GraphqlProtocol.encode_register("1", &op, None).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "start");
        assert_eq!(value["payload"]["variables"], json!({"market": "BTC"}));
        assert!(value["payload"]["variables"].get("cursor").is_none());
    }

    #[test]
    fn register_with_marker_injects_cursor() {
        let op = GraphqlOperation::new("subscription { trades }")
            .with_variables(json!({"market": "BTC"}));
        let marker = ResumeMarker::Cursor("abc==".into());
        let frame = GraphqlProtocol
            .encode_register("1", &op, Some(&marker))
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["payload"]["variables"]["cursor"], "abc==");
        assert_eq!(value["payload"]["variables"]["market"], "BTC");
    }

    #[test]
    fn null_variables_become_an_object_for_the_cursor() {
        let op = GraphqlOperation::new("subscription { trades }");
        let marker = ResumeMarker::Cursor("c1".into());
        let frame = GraphqlProtocol
            .encode_register("1", &op, Some(&marker))
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["payload"]["variables"], json!({"cursor": "c1"}));
    }

    #[test]
    fn scalar_variables_are_rejected() {
        let op = GraphqlOperation::new("query { a }").with_variables(json!(7));
        let err = GraphqlProtocol.encode_register("1", &op, None).unwrap_err();
        assert!(matches!(err, LinkError::Encode(_)));
    }

    #[test]
    fn decode_classifies_lifecycle_frames() {
        assert_eq!(
            GraphqlProtocol.decode(r#"{"type":"connection_ack"}"#).unwrap(),
            Inbound::HandshakeAck
        );
        assert_eq!(
            GraphqlProtocol.decode(r#"{"type":"ka"}"#).unwrap(),
            Inbound::KeepAlive
        );
        match GraphqlProtocol
            .decode(r#"{"type":"connection_error","payload":{"message":"bad token"}}"#)
            .unwrap()
        {
            Inbound::HandshakeError { body } => assert_eq!(body["message"], "bad token"),
            other => panic!("expected handshake error, got {:?}", other),
        }
    }

    #[test]
    fn decode_stream_frames() {
        match GraphqlProtocol
            .decode(r#"{"type":"data","id":"7","payload":{"data":{"x":1}}}"#)
            .unwrap()
        {
            Inbound::Payload { id, body } => {
                assert_eq!(id, "7");
                assert_eq!(body["data"]["x"], 1);
            }
            other => panic!("expected payload, got {:?}", other),
        }
        match GraphqlProtocol
            .decode(r#"{"type":"error","id":"7","payload":{"message":"boom"}}"#)
            .unwrap()
        {
            Inbound::StreamError { id, body } => {
                assert_eq!(id, "7");
                assert_eq!(body["message"], "boom");
            }
            other => panic!("expected stream error, got {:?}", other),
        }
        assert_eq!(
            GraphqlProtocol
                .decode(r#"{"type":"complete","id":"7"}"#)
                .unwrap(),
            Inbound::Complete { id: "7".into() }
        );
    }

    #[test]
    fn data_without_id_is_unroutable() {
        match GraphqlProtocol
            .decode(r#"{"type":"data","payload":{}}"#)
            .unwrap()
        {
            Inbound::Unroutable { detail } => assert!(detail.contains("data")),
            other => panic!("expected unroutable, got {:?}", other),
        }
    }
}
