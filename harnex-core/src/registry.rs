// ABOUTME: ExecutionRegistry - owned directory of live executions with start/attach/cleanup.
// ABOUTME: One routing task demultiplexes the transport's envelope stream by execution id.

use crate::defaults::OptionDefaults;
use crate::error::RegistryError;
use crate::execution::{Execution, DEFAULT_ABORT_TIMEOUT};
use crate::router::ToolHandler;
use crate::transport::{ExecutionTransport, InboundEnvelope};
use harnex_agent::{ClientToolDefinition, Envelope, HarnessId, QueryOptions};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything `start` needs besides the prompt
pub struct StartRequest {
    pub harness: HarnessId,
    /// Caller-chosen id; one is allocated when absent
    pub execution_id: Option<String>,
    pub options: QueryOptions,
    pub tool_handlers: HashMap<String, ToolHandler>,
}

impl StartRequest {
    pub fn new(harness: HarnessId, options: QueryOptions) -> Self {
        Self {
            harness,
            execution_id: None,
            options,
            tool_handlers: HashMap::new(),
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, handler: ToolHandler) -> Self {
        self.tool_handlers.insert(name.into(), handler);
        self
    }
}

#[derive(Default)]
struct RegistryState {
    executions: HashMap<String, Arc<Execution>>,
    /// Live envelopes held back while an attach fetches history
    attaching: HashMap<String, Vec<Envelope>>,
}

struct Shared {
    state: Mutex<RegistryState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn route(&self, inbound: InboundEnvelope) {
        let InboundEnvelope {
            execution_id,
            envelope,
        } = inbound;
        let execution = {
            let mut state = self.lock();
            let live = state.executions.get(&execution_id).cloned();
            match live {
                Some(execution) => execution,
                None => {
                    match state.attaching.get_mut(&execution_id) {
                        Some(parked) => parked.push(envelope),
                        None => {
                            tracing::debug!(execution_id = %execution_id, kind = envelope.kind(), "Dropping envelope for unknown execution");
                        }
                    }
                    return;
                }
            }
        };
        execution.ingest(envelope);
    }
}

pub struct ExecutionRegistry {
    shared: Arc<Shared>,
    transport: Arc<dyn ExecutionTransport>,
    defaults: OptionDefaults,
    abort_timeout: Duration,
    shutdown: CancellationToken,
}

impl ExecutionRegistry {
    /// Subscribe to `transport` and start routing. Requires a tokio runtime.
    pub fn new(transport: Arc<dyn ExecutionTransport>, defaults: OptionDefaults) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(RegistryState::default()),
        });
        let shutdown = CancellationToken::new();
        let inbound = transport.subscribe();
        tokio::spawn(route_inbound(shared.clone(), inbound, shutdown.clone()));

        Self {
            shared,
            transport,
            defaults,
            abort_timeout: DEFAULT_ABORT_TIMEOUT,
            shutdown,
        }
    }

    /// How long an execution's `abort` waits on the backend
    pub fn with_abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout = timeout;
        self
    }

    /// Create, register and launch an execution
    pub fn start(&self, prompt: &str, request: StartRequest) -> Result<Arc<Execution>, RegistryError> {
        let StartRequest {
            harness,
            execution_id,
            options,
            tool_handlers,
        } = request;
        let execution_id = execution_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut options = self.defaults.apply(harness, options);
        expose_client_tools(&mut options, &tool_handlers);

        let execution = Execution::new(&execution_id, harness, self.transport.clone(), self.abort_timeout);
        execution.register_tools(tool_handlers);
        {
            let mut state = self.shared.lock();
            if state.executions.contains_key(&execution_id) || state.attaching.contains_key(&execution_id) {
                return Err(RegistryError::AlreadyExists(execution_id));
            }
            state.executions.insert(execution_id.clone(), execution.clone());
        }

        if let Err(e) = self.transport.begin(&execution_id, harness, prompt, &options) {
            self.shared.lock().executions.remove(&execution_id);
            tracing::error!(execution_id = %execution_id, harness = %harness, error = %e, "Execution could not start");
            return Err(RegistryError::CouldNotStart {
                harness,
                reason: format!("{:#}", e),
            });
        }

        tracing::info!(execution_id = %execution_id, harness = %harness, model = ?options.model, "Execution started");
        Ok(execution)
    }

    /// Reconnect to an execution, restoring its log from the durable side
    pub async fn attach(
        &self,
        execution_id: &str,
        tool_handlers: HashMap<String, ToolHandler>,
    ) -> Result<Arc<Execution>, RegistryError> {
        if let Some(execution) = self.get(execution_id) {
            execution.register_tools(tool_handlers);
            match self.transport.history(execution_id).await {
                Ok(Some(record)) => execution.replay(record.envelopes),
                Ok(None) => {
                    tracing::debug!(execution_id = %execution_id, "No durable history for live execution")
                }
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "Failed to fetch history for live execution")
                }
            }
            return Ok(execution);
        }

        {
            let mut state = self.shared.lock();
            if state.executions.contains_key(execution_id) || state.attaching.contains_key(execution_id) {
                return Err(RegistryError::AttachInProgress(execution_id.to_string()));
            }
            state.attaching.insert(execution_id.to_string(), Vec::new());
        }

        let history = self.transport.history(execution_id).await;
        let record = match history {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.shared.lock().attaching.remove(execution_id);
                tracing::info!(execution_id = %execution_id, "Attach found no history");
                return Err(RegistryError::NotFound(execution_id.to_string()));
            }
            Err(e) => {
                self.shared.lock().attaching.remove(execution_id);
                return Err(RegistryError::Transport(format!("{:#}", e)));
            }
        };

        let execution = Execution::new(execution_id, record.harness_id, self.transport.clone(), self.abort_timeout);
        execution.register_tools(tool_handlers);
        execution.replay(record.envelopes);

        // Parked envelopes go in before the entry becomes visible to the router
        {
            let mut state = self.shared.lock();
            let parked = state.attaching.remove(execution_id).unwrap_or_default();
            if !parked.is_empty() {
                tracing::debug!(execution_id = %execution_id, parked = parked.len(), "Ingesting envelopes that arrived during attach");
            }
            for envelope in parked {
                execution.ingest(envelope);
            }
            state.executions.insert(execution_id.to_string(), execution.clone());
        }

        tracing::info!(execution_id = %execution_id, status = %execution.status(), "Execution attached");
        Ok(execution)
    }

    /// Forget an execution. The backend is left running; use `Execution::abort` to stop it.
    pub fn cleanup(&self, execution_id: &str) -> Option<Arc<Execution>> {
        let removed = self.shared.lock().executions.remove(execution_id);
        if removed.is_some() {
            tracing::debug!(execution_id = %execution_id, "Execution removed from registry");
        }
        removed
    }

    pub fn get(&self, execution_id: &str) -> Option<Arc<Execution>> {
        self.shared.lock().executions.get(execution_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock().executions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.shared.lock().executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn defaults(&self) -> &OptionDefaults {
        &self.defaults
    }

    /// Stop routing inbound envelopes
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ExecutionRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn route_inbound(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<InboundEnvelope>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Registry routing stopped");
                break;
            }
            next = inbound.recv() => match next {
                Some(envelope) => shared.route(envelope),
                None => {
                    tracing::debug!("Transport subscription closed");
                    break;
                }
            },
        }
    }
}

/// Make sure every handler is advertised to the backend as a client tool
fn expose_client_tools(options: &mut QueryOptions, handlers: &HashMap<String, ToolHandler>) {
    let mut names: Vec<&String> = handlers.keys().collect();
    names.sort();
    for name in names {
        if options.client_tools.iter().any(|t| &t.name == name) {
            continue;
        }
        options.client_tools.push(ClientToolDefinition {
            name: name.clone(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::tool_handler;

    #[test]
    fn test_expose_client_tools_adds_missing_definitions() {
        let mut options = QueryOptions::default();
        options.client_tools.push(ClientToolDefinition {
            name: "lookup".to_string(),
            description: "Look things up".to_string(),
            input_schema: json!({"type": "object", "required": ["q"]}),
        });
        let mut handlers: HashMap<String, ToolHandler> = HashMap::new();
        handlers.insert("lookup".to_string(), tool_handler(|_| async { Ok::<_, String>(json!(1)) }));
        handlers.insert("get_magic_number".to_string(), tool_handler(|_| async { Ok::<_, String>(json!(42)) }));

        expose_client_tools(&mut options, &handlers);
        let names: Vec<&str> = options.client_tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["lookup", "get_magic_number"]);
        assert_eq!(options.client_tools[0].description, "Look things up");
    }
}
