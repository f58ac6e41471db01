// ABOUTME: Tool-call router - matches backend tool calls to locally registered handlers.
// ABOUTME: Guarantees one response per call id: a handler result, a handler error, or a fallback.

use futures::future::BoxFuture;
use futures::FutureExt;
use harnex_agent::{ToolCall, ToolResponse};
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A local tool implementation: args in, result or error message out
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Wrap an async closure as a [`ToolHandler`]
pub fn tool_handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// What to do with a tool call
pub enum Route {
    /// Run the handler; the future always resolves to a response
    Invoke(BoxFuture<'static, ToolResponse>),
    /// No handler; answer now
    Immediate(ToolResponse),
    /// This call id was already answered or is being answered
    AlreadyClaimed,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Invoke(_) => f.write_str("Invoke"),
            Route::Immediate(response) => f.debug_tuple("Immediate").field(response).finish(),
            Route::AlreadyClaimed => f.write_str("AlreadyClaimed"),
        }
    }
}

#[derive(Default)]
pub struct ToolRouter {
    handlers: HashMap<String, ToolHandler>,
    claimed: HashSet<String>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for `name`
    pub fn register(&mut self, name: impl Into<String>, handler: ToolHandler) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn extend(&mut self, handlers: impl IntoIterator<Item = (String, ToolHandler)>) {
        self.handlers.extend(handlers);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_claimed(&self, call_id: &str) -> bool {
        self.claimed.contains(call_id)
    }

    /// Claim a call answered elsewhere (e.g. a replayed response). Returns false if already claimed.
    pub fn mark_answered(&mut self, call_id: &str) -> bool {
        self.claimed.insert(call_id.to_string())
    }

    /// Claim `call` and decide how it gets its single response
    pub fn route(&mut self, call: &ToolCall) -> Route {
        if !self.claimed.insert(call.call_id.clone()) {
            tracing::debug!(call_id = %call.call_id, "Tool call already claimed");
            return Route::AlreadyClaimed;
        }

        let Some(handler) = self.handlers.get(&call.tool_name).cloned() else {
            tracing::warn!(tool = %call.tool_name, call_id = %call.call_id, "No handler registered, answering with fallback");
            return Route::Immediate(ToolResponse::unavailable(
                call.call_id.clone(),
                &call.tool_name,
            ));
        };

        let call_id = call.call_id.clone();
        let tool_name = call.tool_name.clone();
        let args = call.args.clone();
        Route::Invoke(Box::pin(async move {
            tracing::debug!(tool = %tool_name, call_id = %call_id, "Invoking tool handler");
            let outcome = AssertUnwindSafe(async move { handler(args).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(result)) => ToolResponse::ok(call_id, result),
                Ok(Err(message)) => {
                    tracing::warn!(tool = %tool_name, error = %message, "Tool handler failed");
                    ToolResponse::err(call_id, message)
                }
                Err(panic) => {
                    let message = format!("Tool '{}' panicked: {}", tool_name, panic_message(&*panic));
                    tracing::error!(tool = %tool_name, "{}", message);
                    ToolResponse::err(call_id, message)
                }
            }
        }))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
