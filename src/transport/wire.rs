//! Phoenix V2 wire framing.
//!
//! Messages travel as five-element JSON arrays:
//! `[join_ref, ref, topic, event, payload]`. Refs are monotonically
//! increasing request correlators, serialized as strings (`"42"`) or `null`
//! the way the Phoenix serializer emits them.

use serde::de::Error as _;
use serde::ser::SerializeTuple as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::Ack;

/// Join request for a topic.
pub const PHX_JOIN: &str = "phx_join";
/// Leave request for a topic.
pub const PHX_LEAVE: &str = "phx_leave";
/// Peer acknowledgment of a ref-carrying request.
pub const PHX_REPLY: &str = "phx_reply";
/// Peer-initiated channel error.
pub const PHX_ERROR: &str = "phx_error";
/// Peer-initiated channel close.
pub const PHX_CLOSE: &str = "phx_close";
/// Reserved topic for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";
/// Heartbeat event on the reserved topic.
pub const HEARTBEAT: &str = "heartbeat";

/// A single Phoenix message.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Ref of the join that opened the channel this frame belongs to
    pub join_ref: Option<u64>,
    /// Correlation ref of this request; replies echo it back
    pub reference: Option<u64>,
    /// Topic the frame is addressed to
    pub topic: String,
    /// Event name (`phx_join`, `phx_reply`, or a user event)
    pub event: String,
    /// Event payload
    pub payload: Value,
}

impl Frame {
    /// Build a join request frame. The join ref doubles as the request ref.
    #[must_use]
    pub fn join(topic: &str, reference: u64, params: Value) -> Self {
        Self {
            join_ref: Some(reference),
            reference: Some(reference),
            topic: topic.to_owned(),
            event: PHX_JOIN.to_owned(),
            payload: params,
        }
    }

    /// Build a leave request frame.
    #[must_use]
    pub fn leave(topic: &str, join_ref: Option<u64>, reference: u64) -> Self {
        Self {
            join_ref,
            reference: Some(reference),
            topic: topic.to_owned(),
            event: PHX_LEAVE.to_owned(),
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Build a user event push frame.
    #[must_use]
    pub fn push(
        topic: &str,
        join_ref: Option<u64>,
        reference: u64,
        event: &str,
        payload: Value,
    ) -> Self {
        Self {
            join_ref,
            reference: Some(reference),
            topic: topic.to_owned(),
            event: event.to_owned(),
            payload,
        }
    }

    /// Build a heartbeat frame on the reserved `phoenix` topic.
    #[must_use]
    pub fn heartbeat(reference: u64) -> Self {
        Self {
            join_ref: None,
            reference: Some(reference),
            topic: PHOENIX_TOPIC.to_owned(),
            event: HEARTBEAT.to_owned(),
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Whether this frame is a peer acknowledgment.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.event == PHX_REPLY
    }

    /// Interpret a `phx_reply` payload as an acknowledgment.
    ///
    /// Reply payloads look like `{"status": "ok", "response": {...}}`. Both
    /// `"error"` and the legacy `"errors"` status spellings count as a
    /// rejection. Returns `None` when the payload has no `status` field.
    #[must_use]
    pub fn reply_ack(&self) -> Option<Ack> {
        let status = self.payload.get("status")?.as_str()?;
        let response = self
            .payload
            .get("response")
            .cloned()
            .unwrap_or(Value::Null);

        match status {
            "ok" => Some(Ack::Ok(response)),
            "error" | "errors" => Some(Ack::Error(response)),
            _ => None,
        }
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(5)?;
        tup.serialize_element(&self.join_ref.map(|r| r.to_string()))?;
        tup.serialize_element(&self.reference.map(|r| r.to_string()))?;
        tup.serialize_element(&self.topic)?;
        tup.serialize_element(&self.event)?;
        tup.serialize_element(&self.payload)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (join_ref, reference, topic, event, payload) =
            <(Value, Value, String, String, Value)>::deserialize(deserializer)?;

        Ok(Self {
            join_ref: parse_ref(&join_ref).map_err(D::Error::custom)?,
            reference: parse_ref(&reference).map_err(D::Error::custom)?,
            topic,
            event,
            payload,
        })
    }
}

/// Parse a wire ref, tolerating the string, integer, and null encodings.
fn parse_ref(value: &Value) -> Result<Option<u64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("ref {n} is not a u64")),
        Value::String(s) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| format!("ref {s:?} is not a u64")),
        other => Err(format!("ref has unexpected type: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn join_frame_serializes_as_v2_array() {
        let frame = Frame::join("room:1", 7, json!({}));
        let text = serde_json::to_string(&frame).expect("frame should serialize");

        assert_eq!(text, r#"["7","7","room:1","phx_join",{}]"#);
    }

    #[test]
    fn reply_frame_parses_with_string_refs() {
        let text = r#"["3","4","room:1","phx_reply",{"status":"ok","response":{"ack":1}}]"#;
        let frame: Frame = serde_json::from_str(text).expect("frame should parse");

        assert_eq!(frame.join_ref, Some(3));
        assert_eq!(frame.reference, Some(4));
        assert!(frame.is_reply());
        assert_eq!(frame.reply_ack(), Some(Ack::Ok(json!({"ack": 1}))));
    }

    #[test]
    fn broadcast_frame_parses_with_null_refs() {
        let text = r#"[null,null,"room:1","new_msg",{"text":"hi"}]"#;
        let frame: Frame = serde_json::from_str(text).expect("frame should parse");

        assert_eq!(frame.join_ref, None);
        assert_eq!(frame.reference, None);
        assert_eq!(frame.event, "new_msg");
    }

    #[test]
    fn error_and_errors_statuses_both_reject() {
        for status in ["error", "errors"] {
            let frame = Frame {
                join_ref: None,
                reference: Some(1),
                topic: "room:1".to_owned(),
                event: PHX_REPLY.to_owned(),
                payload: json!({"status": status, "response": "mock event"}),
            };

            assert_eq!(frame.reply_ack(), Some(Ack::Error(json!("mock event"))));
        }
    }

    #[test]
    fn malformed_ref_is_rejected() {
        let text = r#"[true,null,"room:1","phx_join",{}]"#;
        let result = serde_json::from_str::<Frame>(text);
        assert!(result.is_err(), "boolean ref should not parse");
    }
}
