// ABOUTME: Mock harness for testing - plays back pre-configured envelope scripts.
// ABOUTME: Allows deterministic tests without spawning real agent processes.
//!
//! # Example
//!
//! ```no_run
//! use harnex_agent::backends::mock::{MockHarness, MockStep};
//! use harnex_agent::{EnvelopeBody, Harness, QueryOptions};
//! use serde_json::json;
//!
//! # async fn example() {
//! let mock = MockHarness::new()
//!     .on_prompt("hello").respond_text("Hi there!")
//!     .on_prompt("magic").respond_with(vec![
//!         MockStep::Emit(EnvelopeBody::SessionStarted { session_id: "abc123".into() }),
//!         MockStep::tool_call("c1", "get_magic_number", json!({})),
//!         MockStep::AwaitToolResponse { call_id: "c1".into() },
//!         MockStep::complete(),
//!     ]);
//!
//! let mut handle = mock.query("hello", &QueryOptions::new("/tmp")).unwrap();
//! while let Some(envelope) = handle.events.recv().await {
//!     println!("{}", envelope.kind());
//! }
//! # }
//! ```

use crate::event::{Envelope, EnvelopeBody, ErrorCode, ToolCall, ToolResponse};
use crate::harness::{
    AuthType, Capabilities, CostReporting, Harness, HarnessId, HarnessMeta, InstallStatus,
    ModelInfo, QueryMode, QueryOptions, SlashCommand, ThinkingLevel,
};
use crate::query::{QueryContext, QueryHandle};
use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted action of a mock query
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Emit a freshly-identified envelope
    Emit(EnvelopeBody),
    /// Emit an envelope verbatim, id included
    Envelope(Envelope),
    /// Block until a tool response for `call_id` arrives
    AwaitToolResponse { call_id: String },
    Delay(Duration),
    /// Block until aborted
    Hang,
    /// Block forever, ignoring abort
    Unresponsive,
}

impl MockStep {
    pub fn raw(message: Value) -> Self {
        MockStep::Emit(EnvelopeBody::RawMessage {
            harness_id: HarnessId::Mock,
            message,
        })
    }

    pub fn text(text: &str) -> Self {
        Self::raw(json!({"type": "text", "text": text}))
    }

    pub fn session(session_id: &str) -> Self {
        MockStep::Emit(EnvelopeBody::SessionStarted {
            session_id: session_id.to_string(),
        })
    }

    pub fn tool_call(call_id: &str, tool_name: &str, args: Value) -> Self {
        MockStep::Emit(EnvelopeBody::ToolCall(ToolCall {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            args,
        }))
    }

    pub fn complete() -> Self {
        MockStep::Emit(EnvelopeBody::Complete { usage: None })
    }

    pub fn error(code: ErrorCode, message: &str) -> Self {
        MockStep::Emit(EnvelopeBody::Error {
            message: message.to_string(),
            code,
        })
    }
}

enum MockInstall {
    Status(InstallStatus),
    Fail(String),
    Hang,
}

struct Expectation {
    pattern: String,
    steps: Vec<MockStep>,
}

struct MockState {
    expectations: VecDeque<Expectation>,
    install: MockInstall,
    slash_commands: Vec<SlashCommand>,
    start_error: Option<String>,
    queries: Vec<(String, QueryOptions)>,
    tool_responses: Vec<ToolResponse>,
}

/// Mock harness for testing. Clones share expectations and recordings.
#[derive(Clone)]
pub struct MockHarness {
    state: Arc<Mutex<MockState>>,
}

impl MockHarness {
    /// Create a new mock harness with no expectations
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                expectations: VecDeque::new(),
                install: MockInstall::Status(InstallStatus {
                    installed: true,
                    version: Some("0.0.0-mock".to_string()),
                    auth_type: AuthType::None,
                    authenticated: true,
                    auth_instructions: None,
                }),
                slash_commands: Vec::new(),
                start_error: None,
                queries: Vec::new(),
                tool_responses: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set up an expectation for a prompt containing `pattern`
    pub fn on_prompt(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            harness: self,
            pattern: pattern.to_string(),
        }
    }

    pub fn with_install_status(self, status: InstallStatus) -> Self {
        self.lock().install = MockInstall::Status(status);
        self
    }

    /// Make the raw install probe return an error
    pub fn with_probe_failure(self, message: &str) -> Self {
        self.lock().install = MockInstall::Fail(message.to_string());
        self
    }

    /// Make the raw install probe never finish
    pub fn with_hanging_probe(self) -> Self {
        self.lock().install = MockInstall::Hang;
        self
    }

    pub fn with_slash_commands(self, commands: Vec<SlashCommand>) -> Self {
        self.lock().slash_commands = commands;
        self
    }

    /// Make every subsequent `query` fail before anything is launched
    pub fn fail_to_start(self, message: &str) -> Self {
        self.lock().start_error = Some(message.to_string());
        self
    }

    /// Prompts and options of every accepted query, in order
    pub fn queries(&self) -> Vec<(String, QueryOptions)> {
        self.lock().queries.clone()
    }

    /// Tool responses delivered to any query of this harness
    pub fn tool_responses(&self) -> Vec<ToolResponse> {
        self.lock().tool_responses.clone()
    }

    /// Match expectations with FIFO preference, falling back to the first match in the queue
    fn take_steps(&self, prompt: &str) -> Option<Vec<MockStep>> {
        let mut state = self.lock();
        let exp = &mut state.expectations;
        let index = match exp.front() {
            Some(front) if prompt.contains(&front.pattern) => Some(0),
            Some(_) => exp.iter().position(|e| prompt.contains(&e.pattern)),
            None => None,
        };
        index.and_then(|i| exp.remove(i)).map(|e| e.steps)
    }
}

impl Default for MockHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for setting up mock expectations with a fluent API
pub struct ExpectationBuilder {
    harness: MockHarness,
    pattern: String,
}

impl ExpectationBuilder {
    pub fn respond_with(self, steps: Vec<MockStep>) -> MockHarness {
        self.harness.lock().expectations.push_back(Expectation {
            pattern: self.pattern,
            steps,
        });
        self.harness
    }

    /// Respond with a text message followed by completion
    pub fn respond_text(self, text: &str) -> MockHarness {
        self.respond_with(vec![MockStep::text(text), MockStep::complete()])
    }

    pub fn respond_error(self, code: ErrorCode, message: &str) -> MockHarness {
        self.respond_with(vec![MockStep::error(code, message)])
    }
}

impl Harness for MockHarness {
    fn meta(&self) -> HarnessMeta {
        HarnessMeta {
            id: HarnessId::Mock,
            display_name: "Mock".to_string(),
            binary: "mock".to_string(),
            install_instructions: "The mock harness is built in.".to_string(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            modes: vec![QueryMode::Edit, QueryMode::Plan, QueryMode::ReadOnly],
            supports_resume: true,
            supports_fork: true,
            supports_mcp_servers: false,
            supports_client_tools: true,
            supports_slash_commands: true,
            thinking_levels: vec![ThinkingLevel::Off],
            cost_reporting: CostReporting::None,
        }
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo::default_model("mock-model", "Mock Model")]
    }

    fn probe_install<'a>(&'a self) -> BoxFuture<'a, Result<InstallStatus>> {
        let outcome = match &self.lock().install {
            MockInstall::Status(status) => Some(Ok(status.clone())),
            MockInstall::Fail(message) => Some(Err(anyhow::anyhow!("{}", message))),
            MockInstall::Hang => None,
        };
        Box::pin(async move {
            match outcome {
                Some(result) => result,
                None => std::future::pending().await,
            }
        })
    }

    fn scan_slash_commands<'a>(&'a self, _cwd: &'a Path) -> BoxFuture<'a, Result<Vec<SlashCommand>>> {
        let commands = self.lock().slash_commands.clone();
        Box::pin(async move { Ok(commands) })
    }

    fn query(&self, prompt: &str, options: &QueryOptions) -> Result<QueryHandle> {
        if let Some(message) = self.lock().start_error.clone() {
            anyhow::bail!("{}", message);
        }
        self.lock()
            .queries
            .push((prompt.to_string(), options.clone()));

        let steps = self.take_steps(prompt).unwrap_or_else(|| {
            vec![
                MockStep::text(&format!("Mock: no expectation for '{}'", prompt)),
                MockStep::complete(),
            ]
        });
        let harness = self.clone();
        Ok(QueryHandle::spawn(HarnessId::Mock, move |ctx| {
            play(harness, steps, ctx)
        }))
    }
}

async fn play(harness: MockHarness, steps: Vec<MockStep>, mut ctx: QueryContext) {
    for step in steps {
        let keep_going = match step {
            MockStep::Emit(body) => emit_unless_aborted(&ctx, Envelope::new(body)).await,
            MockStep::Envelope(envelope) => emit_unless_aborted(&ctx, envelope).await,
            MockStep::AwaitToolResponse { call_id } => {
                await_tool_response(&harness, &mut ctx, &call_id).await
            }
            MockStep::Delay(duration) => tokio::select! {
                _ = ctx.cancel.cancelled() => false,
                _ = tokio::time::sleep(duration) => true,
            },
            MockStep::Hang => {
                ctx.cancel.cancelled().await;
                false
            }
            MockStep::Unresponsive => {
                tracing::debug!("Mock query going unresponsive");
                std::future::pending::<()>().await;
                false
            }
        };
        if !keep_going {
            return;
        }
    }

    // Record tool responses that land just after the script ends
    while let Ok(Some(command)) =
        tokio::time::timeout(Duration::from_millis(50), ctx.commands.recv()).await
    {
        record_command(&harness, command);
    }
}

async fn emit_unless_aborted(ctx: &QueryContext, envelope: Envelope) -> bool {
    if ctx.cancel.is_cancelled() {
        return false;
    }
    ctx.emit(envelope).await
}

async fn await_tool_response(harness: &MockHarness, ctx: &mut QueryContext, call_id: &str) -> bool {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return false,
            command = ctx.commands.recv() => match command {
                Some(command) => {
                    if record_command(harness, command).as_deref() == Some(call_id) {
                        return true;
                    }
                }
                None => return false,
            },
        }
    }
}

/// Record a tool response; returns its call id
fn record_command(harness: &MockHarness, command: Envelope) -> Option<String> {
    match command.body {
        EnvelopeBody::ToolResponse(response) => {
            let call_id = response.call_id.clone();
            harness.lock().tool_responses.push(response);
            Some(call_id)
        }
        other => {
            tracing::debug!(kind = other.kind(), "Mock ignoring command");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(handle: &mut QueryHandle) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(envelope) = handle.events.recv().await {
            out.push(envelope);
        }
        out
    }

    #[tokio::test]
    async fn test_mock_simple_response() {
        let mock = MockHarness::new().on_prompt("hello").respond_text("Hi there!");
        let mut handle = mock.query("hello", &QueryOptions::default()).unwrap();
        let events = collect(&mut handle).await;

        assert_eq!(events.len(), 2);
        match &events[0].body {
            EnvelopeBody::RawMessage { message, .. } => assert_eq!(message["text"], "Hi there!"),
            other => panic!("Expected RawMessage, got {:?}", other),
        }
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn test_mock_no_expectation_fallback() {
        let mock = MockHarness::new();
        let mut handle = mock.query("unexpected", &QueryOptions::default()).unwrap();
        let events = collect(&mut handle).await;

        match &events[0].body {
            EnvelopeBody::RawMessage { message, .. } => {
                assert_eq!(message["text"], "Mock: no expectation for 'unexpected'")
            }
            other => panic!("Expected RawMessage, got {:?}", other),
        }
        assert_eq!(events[1].kind(), "complete");
    }

    #[tokio::test]
    async fn test_mock_fifo_with_fallback_search() {
        let mock = MockHarness::new()
            .on_prompt("first")
            .respond_text("one")
            .on_prompt("second")
            .respond_text("two");

        let mut handle = mock.query("second please", &QueryOptions::default()).unwrap();
        let events = collect(&mut handle).await;
        match &events[0].body {
            EnvelopeBody::RawMessage { message, .. } => assert_eq!(message["text"], "two"),
            other => panic!("Expected RawMessage, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_awaits_tool_response() {
        let mock = MockHarness::new().on_prompt("tool").respond_with(vec![
            MockStep::tool_call("c1", "lookup", json!({})),
            MockStep::AwaitToolResponse {
                call_id: "c1".to_string(),
            },
            MockStep::complete(),
        ]);
        let mut handle = mock.query("tool", &QueryOptions::default()).unwrap();

        let first = handle.events.recv().await.unwrap();
        assert_eq!(first.kind(), "tool_call");

        handle
            .control
            .send(Envelope::tool_response(ToolResponse::ok("c1", json!("42"))))
            .unwrap();
        let last = handle.events.recv().await.unwrap();
        assert_eq!(last.kind(), "complete");

        let responses = mock.tool_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].call_id, "c1");
    }

    #[tokio::test]
    async fn test_mock_hang_ends_on_abort() {
        let mock = MockHarness::new()
            .on_prompt("slow")
            .respond_with(vec![MockStep::Hang, MockStep::complete()]);
        let mut handle = mock.query("slow", &QueryOptions::default()).unwrap();

        assert!(handle.control.abort_and_wait(Duration::from_secs(1)).await);
        assert!(handle.events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_unresponsive_ignores_abort() {
        let mock = MockHarness::new()
            .on_prompt("stuck")
            .respond_with(vec![MockStep::Unresponsive]);
        let handle = mock.query("stuck", &QueryOptions::default()).unwrap();

        assert!(!handle.control.abort_and_wait(Duration::from_millis(100)).await);
        assert!(!handle.control.is_finished());
    }

    #[test]
    fn test_mock_fail_to_start() {
        let mock = MockHarness::new().fail_to_start("spawn failed");
        let result = mock.query("hi", &QueryOptions::default());
        assert!(result.is_err());
        assert!(mock.queries().is_empty());
    }
}
