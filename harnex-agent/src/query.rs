// ABOUTME: QueryHandle splits one running query into an event receiver and a cloneable control.
// ABOUTME: Uses channels to talk to the adapter's worker task, plus tokens for abort and completion.

use crate::event::Envelope;
use crate::harness::HarnessId;
use anyhow::Result;
use futures::stream::{self, BoxStream};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffer size of the per-query event channel
const EVENT_CHANNEL_CAPACITY: usize = 2048;

/// A running query: events out, commands and cancellation in
pub struct QueryHandle {
    pub events: EventReceiver,
    pub control: QueryControl,
}

impl QueryHandle {
    /// Spawn `worker` on the current runtime and wire it to a fresh handle.
    ///
    /// The worker owns the backend; when it returns the event channel closes
    /// and `QueryControl::finished` resolves.
    pub fn spawn<F, Fut>(harness_id: HarnessId, worker: F) -> Self
    where
        F: FnOnce(QueryContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        let ctx = QueryContext {
            harness_id,
            events: event_tx,
            commands: command_rx,
            cancel: cancel.clone(),
        };
        let fut = worker(ctx);
        let done = finished.clone();
        tokio::spawn(async move {
            let _guard = done.drop_guard();
            fut.await;
        });

        Self {
            events: EventReceiver::new(event_rx),
            control: QueryControl {
                harness_id,
                commands: command_tx,
                cancel,
                finished,
            },
        }
    }

    pub fn into_parts(self) -> (EventReceiver, QueryControl) {
        (self.events, self.control)
    }
}

/// Send + Clone side of a query used to answer tool calls and stop the backend
#[derive(Clone)]
pub struct QueryControl {
    harness_id: HarnessId,
    commands: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl QueryControl {
    pub fn harness_id(&self) -> HarnessId {
        self.harness_id
    }

    /// Forward a command-direction envelope (e.g. a tool response) to the backend
    pub fn send(&self, command: Envelope) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("Query worker closed"))
    }

    /// Ask the backend to stop. Returns immediately.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Wait for the worker to exit
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    /// Abort and wait at most `grace` for the worker to exit. Returns whether it did.
    pub async fn abort_and_wait(&self, grace: Duration) -> bool {
        self.abort();
        tokio::time::timeout(grace, self.finished()).await.is_ok()
    }
}

/// Worker side of a query
pub struct QueryContext {
    pub harness_id: HarnessId,
    events: mpsc::Sender<Envelope>,
    pub commands: mpsc::UnboundedReceiver<Envelope>,
    pub cancel: CancellationToken,
}

impl QueryContext {
    /// Push an envelope to the consumer. Returns false once the receiver is gone.
    pub async fn emit(&self, envelope: Envelope) -> bool {
        tracing::trace!(harness = %self.harness_id, kind = envelope.kind(), "Emitting envelope");
        if self.events.send(envelope).await.is_err() {
            tracing::debug!(harness = %self.harness_id, "Event receiver closed");
            return false;
        }
        true
    }
}

/// Receiver for the envelopes of one query.
///
/// This is `Send` so it can be passed across async task boundaries. It is a
/// single-pass sequence: once `recv` returns `None` the query is over.
pub struct EventReceiver {
    rx: mpsc::Receiver<Envelope>,
}

impl EventReceiver {
    pub fn new(rx: mpsc::Receiver<Envelope>) -> Self {
        Self { rx }
    }

    /// Receive the next envelope, or None when the query is over
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Try to receive an envelope without blocking
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> BoxStream<'static, Envelope> {
        Box::pin(stream::unfold(self, |mut rx| async move {
            rx.recv().await.map(|envelope| (envelope, rx))
        }))
    }
}
