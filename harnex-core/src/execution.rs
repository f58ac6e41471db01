// ABOUTME: One running invocation of a harness - envelope log, status state machine, tool routing.
// ABOUTME: All ingestion for an execution happens under one lock so dedup and ordering hold.

use crate::error::ExecutionError;
use crate::router::{Route, ToolHandler, ToolRouter};
use crate::transport::ExecutionTransport;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use harnex_agent::{Envelope, EnvelopeBody, HarnessId, ToolCall, ToolResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// How long `abort` waits for the backend before giving up on it
pub const DEFAULT_ABORT_TIMEOUT: Duration = Duration::from_secs(3);

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InProgress,
    Completed,
    Error,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub execution_id: String,
    pub harness_id: HarnessId,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Every accepted envelope, in arrival order
    pub events: Vec<Envelope>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Live notifications for listeners
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionUpdate {
    /// A raw_message payload
    Message(Value),
    /// A stderr line
    Diagnostic(String),
    Status(ExecutionStatus),
    ToolResponse(ToolResponse),
}

/// Result of offering an envelope to an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Id already in the log
    Duplicate,
    /// Declared direction does not match the payload type
    Rejected,
}

struct Inner {
    state: ExecutionState,
    seen: HashSet<String>,
    router: ToolRouter,
}

pub struct Execution {
    id: String,
    harness_id: HarnessId,
    inner: Mutex<Inner>,
    changed: Notify,
    updates: broadcast::Sender<ExecutionUpdate>,
    consumer_active: AtomicBool,
    transport: Arc<dyn ExecutionTransport>,
    abort_timeout: Duration,
}

impl Execution {
    pub fn new(
        execution_id: impl Into<String>,
        harness_id: HarnessId,
        transport: Arc<dyn ExecutionTransport>,
        abort_timeout: Duration,
    ) -> Arc<Self> {
        let id = execution_id.into();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: ExecutionState {
                    execution_id: id.clone(),
                    harness_id,
                    status: ExecutionStatus::InProgress,
                    session_id: None,
                    events: Vec::new(),
                    created_at: Utc::now(),
                    completed_at: None,
                },
                seen: HashSet::new(),
                router: ToolRouter::new(),
            }),
            id,
            harness_id,
            changed: Notify::new(),
            updates,
            consumer_active: AtomicBool::new(false),
            transport,
            abort_timeout,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn harness_id(&self) -> HarnessId {
        self.harness_id
    }

    pub fn state(&self) -> ExecutionState {
        self.lock().state.clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.lock().state.status
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().state.session_id.clone()
    }

    pub fn events(&self) -> Vec<Envelope> {
        self.lock().state.events.clone()
    }

    /// Listen for live updates. Only updates after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionUpdate> {
        self.updates.subscribe()
    }

    pub fn register_tool(&self, name: impl Into<String>, handler: ToolHandler) {
        self.lock().router.register(name, handler);
    }

    pub fn register_tools(&self, handlers: impl IntoIterator<Item = (String, ToolHandler)>) {
        self.lock().router.extend(handlers);
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.lock().router.handler_names()
    }

    /// Offer one envelope to the log, routing tool calls as they arrive
    pub fn ingest(self: &Arc<Self>, envelope: Envelope) -> IngestOutcome {
        self.ingest_with(envelope, true)
    }

    fn ingest_with(self: &Arc<Self>, envelope: Envelope, dispatch: bool) -> IngestOutcome {
        let mut updates = Vec::new();
        let mut route = None;

        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if !envelope.is_well_formed() {
                tracing::warn!(execution_id = %self.id, id = %envelope.id, kind = envelope.kind(), "Rejecting envelope with mismatched direction");
                return IngestOutcome::Rejected;
            }
            if !inner.seen.insert(envelope.id.clone()) {
                tracing::debug!(execution_id = %self.id, id = %envelope.id, "Dropping duplicate envelope");
                return IngestOutcome::Duplicate;
            }

            match &envelope.body {
                EnvelopeBody::RawMessage { message, .. } => {
                    updates.push(ExecutionUpdate::Message(message.clone()));
                }
                EnvelopeBody::Stderr { data } => {
                    updates.push(ExecutionUpdate::Diagnostic(data.clone()));
                }
                EnvelopeBody::SessionStarted { session_id } => {
                    let current = inner.state.session_id.get_or_insert_with(|| {
                        tracing::info!(execution_id = %self.id, session_id = %session_id, "Session started");
                        session_id.clone()
                    });
                    if current != session_id {
                        tracing::warn!(execution_id = %self.id, current = %current, ignored = %session_id, "Second session_started does not re-latch");
                    }
                }
                EnvelopeBody::Complete { .. } => {
                    if let Some(update) = transition(&mut inner.state, ExecutionStatus::Completed) {
                        updates.push(update);
                    }
                }
                EnvelopeBody::Error { message, code } => {
                    tracing::warn!(execution_id = %self.id, code = ?code, error = %message, "Execution reported error");
                    if let Some(update) = transition(&mut inner.state, ExecutionStatus::Error) {
                        updates.push(update);
                    }
                }
                EnvelopeBody::ToolCall(call) => {
                    if dispatch {
                        route = Some((call.clone(), inner.router.route(call)));
                    }
                }
                EnvelopeBody::ToolResponse(response) => {
                    inner.router.mark_answered(&response.call_id);
                    updates.push(ExecutionUpdate::ToolResponse(response.clone()));
                }
                EnvelopeBody::ClearBuffer => {}
            }

            inner.state.events.push(envelope);
        }

        self.changed.notify_waiters();
        for update in updates {
            // No listeners is fine
            let _ = self.updates.send(update);
        }
        if let Some((call, route)) = route {
            self.dispatch(call, route);
        }
        IngestOutcome::Accepted
    }

    fn dispatch(self: &Arc<Self>, call: ToolCall, route: Route) {
        match route {
            Route::Immediate(response) => self.respond(response),
            Route::Invoke(fut) => {
                let execution = Arc::clone(self);
                tokio::spawn(async move {
                    let response = fut.await;
                    execution.respond(response);
                });
            }
            Route::AlreadyClaimed => {
                tracing::debug!(execution_id = %self.id, call_id = %call.call_id, "Tool call already answered");
            }
        }
    }

    /// Record a tool response and deliver it to the backend
    fn respond(self: &Arc<Self>, response: ToolResponse) {
        let call_id = response.call_id.clone();
        let envelope = Envelope::tool_response(response);
        self.ingest_with(envelope.clone(), false);
        if let Err(e) = self.transport.send(&self.id, envelope) {
            tracing::warn!(execution_id = %self.id, call_id = %call_id, error = %e, "Failed to deliver tool response");
        }
    }

    /// Rebuild the log from durable history, then answer any tool call that never got a response
    pub fn replay(self: &Arc<Self>, history: Vec<Envelope>) {
        let total = history.len();
        let accepted = history
            .into_iter()
            .map(|envelope| self.ingest_with(envelope, false))
            .filter(|outcome| *outcome == IngestOutcome::Accepted)
            .count();
        tracing::info!(execution_id = %self.id, total, accepted, "Replayed history");
        self.settle_tool_calls();
    }

    fn settle_tool_calls(self: &Arc<Self>) {
        let routes: Vec<(ToolCall, Route)> = {
            let mut inner = self.lock();
            let Inner { state, router, .. } = &mut *inner;
            state
                .events
                .iter()
                .filter_map(|envelope| match &envelope.body {
                    EnvelopeBody::ToolCall(call) if !router.is_claimed(&call.call_id) => {
                        Some((call.clone(), router.route(call)))
                    }
                    _ => None,
                })
                .collect()
        };
        for (call, route) in routes {
            tracing::info!(execution_id = %self.id, call_id = %call.call_id, tool = %call.tool_name, "Answering unanswered tool call after replay");
            self.dispatch(call, route);
        }
    }

    /// The single live message sequence of this execution
    pub fn messages(self: &Arc<Self>) -> Result<MessageStream, ExecutionError> {
        if self
            .consumer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ExecutionError::ConsumerActive(self.id.clone()));
        }
        Ok(MessageStream {
            execution: Arc::clone(self),
            cursor: 0,
        })
    }

    /// Wait until the execution reaches a terminal status
    pub async fn wait(&self) -> ExecutionStatus {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let status = self.status();
            if status.is_terminal() {
                return status;
            }
            notified.await;
        }
    }

    /// Mark aborted now, then ask the backend to stop within the abort timeout
    pub async fn abort(&self) {
        let transitioned = {
            let mut inner = self.lock();
            transition(&mut inner.state, ExecutionStatus::Aborted)
        };
        let Some(update) = transitioned else {
            tracing::debug!(execution_id = %self.id, status = %self.status(), "Abort on finished execution ignored");
            return;
        };

        tracing::info!(execution_id = %self.id, "Aborting execution");
        self.changed.notify_waiters();
        let _ = self.updates.send(update);

        if tokio::time::timeout(self.abort_timeout, self.transport.abort(&self.id))
            .await
            .is_err()
        {
            tracing::warn!(execution_id = %self.id, timeout = ?self.abort_timeout, "Backend did not acknowledge abort in time");
        }
    }

    /// Tell the backend side its buffered history may be dropped
    pub fn release_buffer(&self) -> anyhow::Result<()> {
        self.transport.send(&self.id, Envelope::clear_buffer())
    }
}

/// Move out of in_progress exactly once; later transitions are ignored
fn transition(state: &mut ExecutionState, to: ExecutionStatus) -> Option<ExecutionUpdate> {
    if state.status.is_terminal() {
        tracing::debug!(execution_id = %state.execution_id, status = %state.status, ignored = %to, "Status already terminal");
        return None;
    }
    state.status = to;
    state.completed_at = Some(Utc::now());
    Some(ExecutionUpdate::Status(to))
}

/// Lazy sequence of raw messages. Ends after the log is drained and the status is terminal.
pub struct MessageStream {
    execution: Arc<Execution>,
    cursor: usize,
}

impl MessageStream {
    pub async fn next(&mut self) -> Option<Value> {
        let execution = Arc::clone(&self.execution);
        loop {
            let notified = execution.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.poll_log() {
                return message;
            }
            notified.await;
        }
    }

    /// `Some(Some(_))` a message, `Some(None)` the end, `None` nothing yet
    fn poll_log(&mut self) -> Option<Option<Value>> {
        let inner = self.execution.lock();
        let events = &inner.state.events;
        while self.cursor < events.len() {
            let envelope = &events[self.cursor];
            self.cursor += 1;
            if let EnvelopeBody::RawMessage { message, .. } = &envelope.body {
                return Some(Some(message.clone()));
            }
        }
        inner.state.status.is_terminal().then_some(None)
    }

    pub fn into_stream(self) -> BoxStream<'static, Value> {
        Box::pin(stream::unfold(self, |mut messages| async move {
            messages.next().await.map(|message| (message, messages))
        }))
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.execution.consumer_active.store(false, Ordering::Release);
    }
}
