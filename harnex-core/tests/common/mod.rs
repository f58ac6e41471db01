// ABOUTME: Shared test doubles for harnex-core integration tests.
// ABOUTME: RecordingTransport captures outbound commands and can stall on abort.

#![allow(dead_code)]

use anyhow::Result;
use futures::future::BoxFuture;
use harnex_agent::{Envelope, HarnessId, QueryOptions, ToolResponse};
use harnex_core::{ExecutionRecord, ExecutionTransport, InboundEnvelope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(String, Envelope)>>,
    pub histories: Mutex<HashMap<String, ExecutionRecord>>,
    pub aborts: AtomicUsize,
    /// When set, abort never resolves
    pub stall_abort: bool,
}

impl RecordingTransport {
    pub fn stalling() -> Self {
        Self {
            stall_abort: true,
            ..Self::default()
        }
    }

    pub fn tool_responses(&self) -> Vec<ToolResponse> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, envelope)| match &envelope.body {
                harnex_agent::EnvelopeBody::ToolResponse(response) => Some(response.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|(_, e)| e.kind()).collect()
    }
}

impl ExecutionTransport for RecordingTransport {
    fn begin(&self, _: &str, _: HarnessId, _: &str, _: &QueryOptions) -> Result<()> {
        Ok(())
    }

    fn send(&self, execution_id: &str, command: Envelope) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((execution_id.to_string(), command));
        Ok(())
    }

    fn abort<'a>(&'a self, _: &'a str) -> BoxFuture<'a, ()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        let stall = self.stall_abort;
        Box::pin(async move {
            if stall {
                std::future::pending::<()>().await;
            }
        })
    }

    fn history<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, Result<Option<ExecutionRecord>>> {
        let record = self.histories.lock().unwrap().get(execution_id).cloned();
        Box::pin(async move { Ok(record) })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundEnvelope> {
        mpsc::unbounded_channel().1
    }
}

/// Poll `check` until it holds or a second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check()
}
