//! The wire envelope shared by the WebSocket transport and the SSE/inbox
//! pair. Both transports MUST produce and accept exactly this shape so a
//! client can move between them without re-implementing framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u8 = 1;

/// `{v, t, id?, ts?, body}`. Unknown fields are ignored by `serde`'s default
/// behavior; no `deny_unknown_fields` anywhere in this module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub v: u8,
    pub t: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    pub body: Value,
}

impl Frame {
    pub fn new(t: impl Into<String>, body: Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            t: t.into(),
            id: None,
            ts: Some(now_ms()),
            body,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn error(code: &str, message: &str, extra: Value) -> Self {
        let mut body = serde_json::json!({ "code": code, "message": message });
        if let (Some(obj), Some(extra_obj)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        Self::new("error", body)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("frame serializes to json")
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub mod t {
    pub const SESSION_START: &str = "session.start";
    pub const SESSION_RESUME: &str = "session.resume";
    pub const SESSION_READY: &str = "session.ready";
    pub const CONV_SUBSCRIBE: &str = "conv.subscribe";
    pub const CONV_SEND: &str = "conv.send";
    pub const CONV_ACKED: &str = "conv.acked";
    pub const CONV_EVENT: &str = "conv.event";
    pub const CONV_ACK: &str = "conv.ack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
    pub const PRESENCE_UPDATE: &str = "presence.update";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_in_body_round_trip_without_error() {
        let json = r#"{"v":1,"t":"conv.send","body":{"conv_id":"c1","msg_id":"m1","env":"aGVsbG8=","future_field":42}}"#;
        let frame = Frame::from_json(json).unwrap();
        assert_eq!(frame.t, "conv.send");
        assert_eq!(frame.body["future_field"], 42);
    }

    #[test]
    fn error_frame_merges_extra_fields() {
        let frame = Frame::error("rate_limited", "too many sends", serde_json::json!({ "retry_after_s": 5 }));
        assert_eq!(frame.body["code"], "rate_limited");
        assert_eq!(frame.body["retry_after_s"], 5);
    }
}
