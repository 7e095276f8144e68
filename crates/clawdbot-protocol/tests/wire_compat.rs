//! Wire-format compatibility tests — exact JSON shapes clients depend on.

use clawdbot_protocol::{ErrorCode, EventFrame, Hello, InboundFrame, ResFrame};
use serde_json::{json, Value};

#[test]
fn res_ok_shape() {
    let frame = ResFrame::ok("42", json!({ "sessions": [] }));
    let value: Value = serde_json::to_value(&frame).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "res",
            "id": "42",
            "ok": true,
            "payload": { "sessions": [] }
        })
    );
}

#[test]
fn res_err_shape() {
    let frame = ResFrame::err("7", ErrorCode::Conflict, "label already in use: travel");
    let value: Value = serde_json::to_value(&frame).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "res",
            "id": "7",
            "ok": false,
            "error": {
                "code": "CONFLICT",
                "message": "label already in use: travel"
            }
        })
    );
}

#[test]
fn hello_shape() {
    let hello = Hello::new("0.3.0", vec!["agent".into(), "ping".into()]);
    let value: Value = serde_json::to_value(&hello).unwrap();
    assert_eq!(
        value,
        json!({
            "ok": true,
            "type": "hello",
            "features": { "methods": ["agent", "ping"] },
            "serverVersion": "0.3.0"
        })
    );
}

#[test]
fn progress_event_carries_request_id() {
    let frame = EventFrame::progress("42", "agent.delta", json!({ "text": "hi" }));
    let value: Value = serde_json::to_value(&frame).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "event",
            "event": "agent.delta",
            "id": "42",
            "payload": { "text": "hi" }
        })
    );
}

#[test]
fn broadcast_event_with_seq() {
    let frame = EventFrame::broadcast("tick", json!({ "ts": 1 })).with_seq(9);
    let value: Value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["seq"], json!(9));
    assert!(value.get("id").is_none());
}

#[test]
fn inbound_rejects_unknown_type_for_requests() {
    let inbound: InboundFrame =
        serde_json::from_str(r#"{"type":"res","id":"1","ok":true}"#).unwrap();
    assert!(inbound.as_req().is_none());
}

#[test]
fn req_with_expect_final_round_trips() {
    let raw = r#"{"type":"req","id":"9","method":"agent","expectFinal":true}"#;
    let inbound: InboundFrame = serde_json::from_str(raw).unwrap();
    let req = inbound.as_req().unwrap();
    assert!(req.expect_final);
    assert!(req.params.is_none());
}
