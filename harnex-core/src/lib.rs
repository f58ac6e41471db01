// ABOUTME: Execution layer over harnex-agent harnesses.
// ABOUTME: Provides executions, tool-call routing, the registry and an in-process query host.

pub mod defaults;
pub mod error;
pub mod execution;
pub mod host;
pub mod registry;
pub mod router;
pub mod transport;

pub use defaults::{HarnessDefaults, OptionDefaults};
pub use error::{ExecutionError, RegistryError};
pub use execution::{
    Execution, ExecutionState, ExecutionStatus, ExecutionUpdate, IngestOutcome, MessageStream,
};
pub use host::QueryHost;
pub use registry::{ExecutionRegistry, StartRequest};
pub use router::{tool_handler, Route, ToolHandler, ToolRouter};
pub use transport::{ExecutionRecord, ExecutionTransport, InboundEnvelope};

// Re-export harnex-agent types
pub use harnex_agent::{Envelope, EnvelopeBody, HarnessCatalog, HarnessId, QueryOptions};
