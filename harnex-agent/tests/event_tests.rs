// ABOUTME: Tests for the envelope wire format and tool response helpers.
// ABOUTME: Validates tagging, direction checks and error classification.

use harnex_agent::{Direction, Envelope, EnvelopeBody, ErrorCode, HarnessId, ToolResponse, Usage};
use serde_json::json;

#[test]
fn test_raw_message_wire_shape() {
    let envelope = Envelope::with_id(
        "e1",
        EnvelopeBody::RawMessage {
            harness_id: HarnessId::ClaudeCode,
            message: json!({"type": "assistant"}),
        },
    );
    let json = serde_json::to_value(&envelope).unwrap();
    assert_eq!(
        json,
        json!({
            "id": "e1",
            "direction": "execution",
            "type": "raw_message",
            "harnessId": "claude-code",
            "message": {"type": "assistant"}
        })
    );
}

#[test]
fn test_tool_call_wire_shape() {
    let envelope = Envelope::tool_call("c1", "get_magic_number", json!({"seed": 1}));
    let json = serde_json::to_value(&envelope).unwrap();
    assert_eq!(json["type"], "tool_call");
    assert_eq!(json["callId"], "c1");
    assert_eq!(json["toolName"], "get_magic_number");
    assert_eq!(json["args"]["seed"], 1);
    assert_eq!(json["direction"], "execution");
}

#[test]
fn test_command_envelopes_travel_toward_backend() {
    let response = Envelope::tool_response(ToolResponse::ok("c1", json!("42")));
    assert_eq!(response.direction, Direction::Command);
    assert_eq!(Envelope::clear_buffer().direction, Direction::Command);

    let json = serde_json::to_value(Envelope::clear_buffer()).unwrap();
    assert_eq!(json["type"], "clear_buffer");
}

#[test]
fn test_envelope_deserializes() {
    let envelope: Envelope = serde_json::from_value(json!({
        "id": "e9",
        "direction": "execution",
        "type": "complete",
        "usage": {"inputTokens": 10, "outputTokens": 5, "costUsd": 0.002}
    }))
    .unwrap();

    assert_eq!(envelope.id, "e9");
    assert!(envelope.is_terminal());
    match envelope.body {
        EnvelopeBody::Complete { usage: Some(usage) } => {
            assert_eq!(usage.input_tokens, 10);
            assert_eq!(usage.cost_usd, Some(0.002));
        }
        other => panic!("Expected Complete, got {:?}", other),
    }
}

#[test]
fn test_error_envelope_code_serializes_snake_case() {
    let envelope = Envelope::error(ErrorCode::SessionDefunct, "No conversation found");
    let json = serde_json::to_value(&envelope).unwrap();
    assert_eq!(json["code"], "session_defunct");
    assert_eq!(json["message"], "No conversation found");
}

#[test]
fn test_mismatched_direction_is_not_well_formed() {
    let mut envelope = Envelope::session_started("abc123");
    assert!(envelope.is_well_formed());
    envelope.direction = Direction::Command;
    assert!(!envelope.is_well_formed());
}

#[test]
fn test_fresh_envelopes_have_unique_ids() {
    let a = Envelope::stderr("one");
    let b = Envelope::stderr("one");
    assert_ne!(a.id, b.id);
}

#[test]
fn test_unavailable_tool_response() {
    let response = ToolResponse::unavailable("c7", "get_magic_number");
    assert!(!response.is_error());
    let result = response.result.clone().unwrap();
    assert_eq!(result["unavailable"], true);
    assert!(response
        .content_text()
        .contains("Tool 'get_magic_number' handler unavailable"));
}

#[test]
fn test_content_text_variants() {
    assert_eq!(ToolResponse::ok("c", json!("42")).content_text(), "42");
    assert_eq!(ToolResponse::err("c", "boom").content_text(), "boom");
    assert_eq!(
        ToolResponse::ok("c", json!({"n": 42})).content_text(),
        r#"{"n":42}"#
    );
}

#[test]
fn test_error_classification() {
    assert_eq!(ErrorCode::classify("Request timed out"), ErrorCode::Timeout);
    assert_eq!(ErrorCode::classify("HTTP 429 Too Many Requests"), ErrorCode::RateLimited);
    assert_eq!(ErrorCode::classify("Invalid API key"), ErrorCode::AuthFailed);
    assert_eq!(ErrorCode::classify("Permission denied: /etc"), ErrorCode::PermissionDenied);
    assert_eq!(ErrorCode::classify("overloaded"), ErrorCode::BackendError);
}

#[test]
fn test_usage_omits_absent_fields() {
    let usage = Usage {
        input_tokens: 1,
        output_tokens: 2,
        ..Usage::default()
    };
    let json = serde_json::to_value(&usage).unwrap();
    assert_eq!(json, json!({"inputTokens": 1, "outputTokens": 2}));
}
