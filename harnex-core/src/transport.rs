// ABOUTME: ExecutionTransport - the seam between executions and whatever hosts the backends.
// ABOUTME: Carries begin/abort/send outward and one inbound envelope subscription back.

use anyhow::Result;
use futures::future::BoxFuture;
use harnex_agent::{Envelope, HarnessId, QueryOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// An execution-direction envelope tagged with the execution it belongs to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    pub execution_id: String,
    pub envelope: Envelope,
}

/// Durable history of one execution, as kept by the backend side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub harness_id: HarnessId,
    pub envelopes: Vec<Envelope>,
}

pub trait ExecutionTransport: Send + Sync {
    /// Launch a backend for `execution_id`. Fails synchronously if it cannot start.
    fn begin(
        &self,
        execution_id: &str,
        harness: HarnessId,
        prompt: &str,
        options: &QueryOptions,
    ) -> Result<()>;

    /// Deliver a command-direction envelope (tool_response, clear_buffer)
    fn send(&self, execution_id: &str, command: Envelope) -> Result<()>;

    /// Ask the backend to stop. Resolves when it stopped or the transport gave up waiting.
    fn abort<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, ()>;

    /// Buffered history for reattach; `None` when the execution is unknown
    fn history<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, Result<Option<ExecutionRecord>>>;

    /// The inbound envelope stream. A new subscription replaces the previous one.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundEnvelope>;
}
