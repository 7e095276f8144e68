use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of wire error codes. Anything a handler produces maps onto
/// one of these before it reaches a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    NotFound,
    Conflict,
    Unavailable,
    Timeout,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Parse the `code()` string carried by crate error types.
    pub fn from_code_str(code: &str) -> Self {
        match code {
            "INVALID_REQUEST" => ErrorCode::InvalidRequest,
            "UNAUTHORIZED" => ErrorCode::Unauthorized,
            "NOT_FOUND" => ErrorCode::NotFound,
            "CONFLICT" => ErrorCode::Conflict,
            "UNAVAILABLE" => ErrorCode::Unavailable,
            "TIMEOUT" => ErrorCode::Timeout,
            _ => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Client → Server request.
/// Wire: `{ "type": "req", "id": "abc", "method": "agent", "params": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// A repeated key within the server's window replays the cached result.
    #[serde(rename = "idempotencyKey", skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// When true the client resolves only on the final frame and treats
    /// same-id events as progress.
    #[serde(rename = "expectFinal", default, skip_serializing_if = "is_false")]
    pub expect_final: bool,
}

fn is_false(b: &bool) -> bool {
    !b
}

/// Server → Client final response.
/// Wire: `{ "type": "res", "id": "abc", "ok": true, "payload": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResFrame {
    pub fn ok(id: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            frame_type: "res".to_string(),
            id: id.into(),
            ok: true,
            payload: Some(serde_json::to_value(payload).unwrap_or(Value::Null)),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: ErrorCode, message: &str) -> Self {
        Self {
            frame_type: "res".to_string(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code,
                message: message.to_string(),
                details: None,
            }),
        }
    }
}

/// Server → Client event. Request-scoped progress events carry the
/// originating request `id`; broadcast events carry `seq` instead.
/// Wire: `{ "type": "event", "event": "agent.delta", "id": "abc", "payload": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn broadcast(event: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            frame_type: "event".to_string(),
            event: event.into(),
            id: None,
            payload: Some(serde_json::to_value(payload).unwrap_or(Value::Null)),
            seq: None,
        }
    }

    /// Progress event tied to an in-flight request.
    pub fn progress(id: impl Into<String>, event: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            frame_type: "event".to_string(),
            event: event.into(),
            id: Some(id.into()),
            payload: Some(serde_json::to_value(payload).unwrap_or(Value::Null)),
            seq: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }
}

/// Raw inbound frame — parse the `type` discriminator first.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl InboundFrame {
    /// Try to interpret this frame as a client request.
    pub fn as_req(&self) -> Option<ReqFrame> {
        if self.frame_type != "req" {
            return None;
        }
        let mut map = self.rest.clone();
        map.insert("type".to_string(), Value::String("req".to_string()));
        serde_json::from_value(Value::Object(map)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_parses_with_idempotency_key() {
        let raw = r#"{"type":"req","id":"1","method":"agent","params":{"message":"hi"},"idempotencyKey":"k1"}"#;
        let inbound: InboundFrame = serde_json::from_str(raw).unwrap();
        let req = inbound.as_req().unwrap();
        assert_eq!(req.method, "agent");
        assert_eq!(req.idempotency_key.as_deref(), Some("k1"));
        assert!(!req.expect_final);
    }

    #[test]
    fn non_req_frame_is_rejected_by_as_req() {
        let raw = r#"{"type":"event","event":"tick"}"#;
        let inbound: InboundFrame = serde_json::from_str(raw).unwrap();
        assert!(inbound.as_req().is_none());
    }

    #[test]
    fn error_codes_round_trip() {
        for code in [
            ErrorCode::InvalidRequest,
            ErrorCode::Unauthorized,
            ErrorCode::NotFound,
            ErrorCode::Conflict,
            ErrorCode::Unavailable,
            ErrorCode::Timeout,
            ErrorCode::Internal,
        ] {
            let s = serde_json::to_string(&code).unwrap();
            let back: ErrorCode = serde_json::from_str(&s).unwrap();
            assert_eq!(back, code);
            assert_eq!(ErrorCode::from_code_str(s.trim_matches('"')), code);
        }
    }
}
