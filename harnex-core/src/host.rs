// ABOUTME: QueryHost - in-process ExecutionTransport that runs harness queries directly.
// ABOUTME: Buffers every execution's envelopes so a restarted consumer can reattach.

use crate::transport::{ExecutionRecord, ExecutionTransport, InboundEnvelope};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use harnex_agent::{
    Envelope, EnvelopeBody, EventReceiver, HarnessCatalog, HarnessId, QueryControl, QueryOptions,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long `abort` waits for a query worker to exit
pub const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(2);

struct HostedQuery {
    harness_id: HarnessId,
    control: QueryControl,
    buffer: Vec<Envelope>,
    /// Set by clear_buffer; afterwards only what a reattaching consumer needs is kept
    released: bool,
    /// The backend's event stream has ended
    drained: bool,
}

impl HostedQuery {
    fn record(&mut self, envelope: &Envelope) {
        if !self.released || kept_after_release(&envelope.body) {
            self.buffer.push(envelope.clone());
        }
    }

    fn record_response(&mut self, command: &Envelope) {
        let EnvelopeBody::ToolResponse(response) = &command.body else {
            return;
        };
        if self.released {
            self.buffer.retain(|e| {
                !matches!(&e.body, EnvelopeBody::ToolCall(call) if call.call_id == response.call_id)
            });
        } else {
            self.buffer.push(command.clone());
        }
    }

    /// Drop everything except the session id, unanswered tool calls and the outcome
    fn release(&mut self) {
        let answered: HashSet<String> = self
            .buffer
            .iter()
            .filter_map(|e| match &e.body {
                EnvelopeBody::ToolResponse(response) => Some(response.call_id.clone()),
                _ => None,
            })
            .collect();
        self.buffer.retain(|e| match &e.body {
            EnvelopeBody::ToolCall(call) => !answered.contains(&call.call_id),
            body => kept_after_release(body),
        });
        self.released = true;
    }
}

fn kept_after_release(body: &EnvelopeBody) -> bool {
    matches!(
        body,
        EnvelopeBody::SessionStarted { .. } | EnvelopeBody::ToolCall(_)
    ) || body.is_terminal()
}

#[derive(Default)]
struct HostState {
    queries: HashMap<String, HostedQuery>,
    subscriber: Option<mpsc::UnboundedSender<InboundEnvelope>>,
}

pub struct QueryHost {
    catalog: HarnessCatalog,
    state: Arc<Mutex<HostState>>,
    abort_grace: Duration,
}

impl QueryHost {
    pub fn new(catalog: HarnessCatalog) -> Self {
        Self {
            catalog,
            state: Arc::new(Mutex::new(HostState::default())),
            abort_grace: DEFAULT_ABORT_GRACE,
        }
    }

    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    pub fn catalog(&self) -> &HarnessCatalog {
        &self.catalog
    }

    /// Execution ids this host has launched and still tracks
    pub fn hosted(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.state).queries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the query behind `execution_id` is still running
    pub fn is_running(&self, execution_id: &str) -> bool {
        lock(&self.state)
            .queries
            .get(execution_id)
            .is_some_and(|q| !q.control.is_finished())
    }
}

fn lock(state: &Mutex<HostState>) -> MutexGuard<'_, HostState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Forward one query's envelopes into the buffer and the current subscriber
async fn pump(state: Arc<Mutex<HostState>>, execution_id: String, mut events: EventReceiver) {
    while let Some(envelope) = events.recv().await {
        let subscriber = {
            let mut state = lock(&state);
            if let Some(query) = state.queries.get_mut(&execution_id) {
                query.record(&envelope);
            }
            state.subscriber.clone()
        };
        match subscriber {
            Some(tx) => {
                let inbound = InboundEnvelope {
                    execution_id: execution_id.clone(),
                    envelope,
                };
                if tx.send(inbound).is_err() {
                    tracing::debug!(execution_id = %execution_id, "Subscriber gone, envelope kept in buffer only");
                }
            }
            None => {
                tracing::trace!(execution_id = %execution_id, "No subscriber, envelope kept in buffer only");
            }
        }
    }
    tracing::debug!(execution_id = %execution_id, "Query event stream ended");

    let mut state = lock(&state);
    let released = match state.queries.get_mut(&execution_id) {
        Some(query) => {
            query.drained = true;
            query.released
        }
        None => false,
    };
    if released {
        state.queries.remove(&execution_id);
        tracing::debug!(execution_id = %execution_id, "Released query finished, no longer tracked");
    }
}

impl ExecutionTransport for QueryHost {
    fn begin(
        &self,
        execution_id: &str,
        harness: HarnessId,
        prompt: &str,
        options: &QueryOptions,
    ) -> Result<()> {
        if lock(&self.state).queries.contains_key(execution_id) {
            anyhow::bail!("Execution {} is already running", execution_id);
        }

        let handle = self
            .catalog
            .get(harness)?
            .query(prompt, options)
            .with_context(|| format!("Failed to launch {}", harness))?;
        let (events, control) = handle.into_parts();

        lock(&self.state).queries.insert(
            execution_id.to_string(),
            HostedQuery {
                harness_id: harness,
                control,
                buffer: Vec::new(),
                released: false,
                drained: false,
            },
        );
        tracing::info!(execution_id = %execution_id, harness = %harness, "Query launched");

        tokio::spawn(pump(self.state.clone(), execution_id.to_string(), events));
        Ok(())
    }

    fn send(&self, execution_id: &str, command: Envelope) -> Result<()> {
        let mut state = lock(&self.state);
        let query = state
            .queries
            .get_mut(execution_id)
            .with_context(|| format!("Unknown execution: {}", execution_id))?;

        match &command.body {
            EnvelopeBody::ClearBuffer => {
                tracing::debug!(execution_id = %execution_id, buffered = query.buffer.len(), "Releasing buffered history");
                query.release();
                if query.drained {
                    state.queries.remove(execution_id);
                    tracing::debug!(execution_id = %execution_id, "Finished query released, no longer tracked");
                }
                Ok(())
            }
            EnvelopeBody::ToolResponse(_) => {
                query.record_response(&command);
                query.control.send(command)
            }
            other => anyhow::bail!("Cannot send {} to a backend", other.kind()),
        }
    }

    fn abort<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let control = lock(&self.state)
                .queries
                .get(execution_id)
                .map(|q| q.control.clone());
            let Some(control) = control else {
                tracing::debug!(execution_id = %execution_id, "Abort for unknown execution");
                return;
            };
            if !control.abort_and_wait(self.abort_grace).await {
                tracing::warn!(execution_id = %execution_id, grace = ?self.abort_grace, "Query did not stop within grace period");
            }
        })
    }

    fn history<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, Result<Option<ExecutionRecord>>> {
        Box::pin(async move {
            Ok(lock(&self.state)
                .queries
                .get(execution_id)
                .map(|q| ExecutionRecord {
                    harness_id: q.harness_id,
                    envelopes: q.buffer.clone(),
                }))
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        if lock(&self.state).subscriber.replace(tx).is_some() {
            tracing::info!("Replacing previous envelope subscriber");
        }
        rx
    }
}
