// ABOUTME: Session Event Model - the envelope vocabulary shared by adapters and executions.
// ABOUTME: Execution-direction events flow backend -> consumer, command-direction events flow back.

use crate::harness::HarnessId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Which way an envelope travels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Backend -> consumer
    Execution,
    /// Consumer -> backend
    Command,
}

/// The uniform record exchanged between a backend and its consumer.
///
/// On the wire the body is flattened next to `id` and `direction`, so an
/// envelope reads `{"id": ..., "direction": ..., "type": ..., ...payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Opaque unique id, used for deduplication on replay
    pub id: String,
    pub direction: Direction,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

/// Envelope payloads, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EnvelopeBody {
    /// Opaque harness-specific message, narrowed by the caller using `harness_id`
    RawMessage { harness_id: HarnessId, message: Value },

    /// One line of backend diagnostics
    Stderr { data: String },

    /// Backend assigned (or confirmed) a session id
    SessionStarted { session_id: String },

    /// Backend asks the consumer to run a locally registered tool
    ToolCall(ToolCall),

    /// Turn finished successfully
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// Turn failed
    Error { message: String, code: ErrorCode },

    /// Consumer's answer to a `ToolCall`
    ToolResponse(ToolResponse),

    /// History is durable elsewhere; buffered envelopes may be released
    ClearBuffer,
}

/// Backend-initiated tool invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

/// Answer to a tool call. Exactly one of `result` / `error` is normally set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    pub fn ok(call_id: impl Into<String>, result: Value) -> Self {
        Self {
            call_id: call_id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Fallback answer when no handler is registered for the tool
    pub fn unavailable(call_id: impl Into<String>, tool_name: &str) -> Self {
        Self::ok(
            call_id,
            json!({
                "content": format!(
                    "Tool '{}' handler unavailable: the client that registered it is no longer connected",
                    tool_name
                ),
                "unavailable": true,
            }),
        )
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Flatten the response into the text a CLI backend expects as tool output
    pub fn content_text(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        match &self.result {
            Some(Value::String(s)) => s.clone(),
            Some(value) => match value.get("content") {
                Some(Value::String(s)) => s.clone(),
                _ => value.to_string(),
            },
            None => String::new(),
        }
    }
}

/// Typed error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request timed out
    Timeout,
    /// Rate limited by the backend
    RateLimited,
    /// Authentication failed
    AuthFailed,
    /// The session being resumed no longer exists on the backend
    SessionDefunct,
    /// Tool execution failed
    ToolFailed,
    /// Permission denied for operation
    PermissionDenied,
    /// Backend process could not be launched
    LaunchFailed,
    /// Backend-specific error
    BackendError,
    /// Unknown error
    Unknown,
}

impl ErrorCode {
    /// Best-effort classification of a backend error message
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            ErrorCode::Timeout
        } else if lower.contains("rate limit") || lower.contains("429") {
            ErrorCode::RateLimited
        } else if lower.contains("authentication") || lower.contains("api key") || lower.contains("401") {
            ErrorCode::AuthFailed
        } else if lower.contains("permission") {
            ErrorCode::PermissionDenied
        } else {
            ErrorCode::BackendError
        }
    }
}

/// Token usage and cost for a completed turn
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Only set by harnesses that report dollars; others leave it to the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

impl EnvelopeBody {
    /// The direction this payload type travels in
    pub fn direction(&self) -> Direction {
        match self {
            EnvelopeBody::ToolResponse(_) | EnvelopeBody::ClearBuffer => Direction::Command,
            _ => Direction::Execution,
        }
    }

    /// Wire name of the payload type
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopeBody::RawMessage { .. } => "raw_message",
            EnvelopeBody::Stderr { .. } => "stderr",
            EnvelopeBody::SessionStarted { .. } => "session_started",
            EnvelopeBody::ToolCall(_) => "tool_call",
            EnvelopeBody::Complete { .. } => "complete",
            EnvelopeBody::Error { .. } => "error",
            EnvelopeBody::ToolResponse(_) => "tool_response",
            EnvelopeBody::ClearBuffer => "clear_buffer",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvelopeBody::Complete { .. } | EnvelopeBody::Error { .. })
    }
}

impl Envelope {
    /// Wrap a body in a fresh envelope with a new unique id
    pub fn new(body: EnvelopeBody) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), body)
    }

    /// Wrap a body with a caller-chosen id (replays, tests)
    pub fn with_id(id: impl Into<String>, body: EnvelopeBody) -> Self {
        Self {
            id: id.into(),
            direction: body.direction(),
            body,
        }
    }

    pub fn raw_message(harness_id: HarnessId, message: Value) -> Self {
        Self::new(EnvelopeBody::RawMessage {
            harness_id,
            message,
        })
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::new(EnvelopeBody::Stderr { data: data.into() })
    }

    pub fn session_started(session_id: impl Into<String>) -> Self {
        Self::new(EnvelopeBody::SessionStarted {
            session_id: session_id.into(),
        })
    }

    pub fn tool_call(call_id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        Self::new(EnvelopeBody::ToolCall(ToolCall {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            args,
        }))
    }

    pub fn complete(usage: Option<Usage>) -> Self {
        Self::new(EnvelopeBody::Complete { usage })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(EnvelopeBody::Error {
            message: message.into(),
            code,
        })
    }

    pub fn tool_response(response: ToolResponse) -> Self {
        Self::new(EnvelopeBody::ToolResponse(response))
    }

    pub fn clear_buffer() -> Self {
        Self::new(EnvelopeBody::ClearBuffer)
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.body.is_terminal()
    }

    /// True when the declared direction agrees with the payload type
    pub fn is_well_formed(&self) -> bool {
        self.direction == self.body.direction()
    }
}
