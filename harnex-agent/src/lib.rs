// ABOUTME: Uniform adapter layer over external AI coding-agent CLIs.
// ABOUTME: Provides the Harness trait, the envelope event model and CLI/mock backends.

pub mod event;
pub mod harness;
pub mod query;
pub mod catalog;
pub mod config;

pub mod backends;
mod bridge;
mod process;

pub use catalog::HarnessCatalog;
pub use config::AgentConfig;
pub use event::{Direction, Envelope, EnvelopeBody, ErrorCode, ToolCall, ToolResponse, Usage};
pub use harness::{
    AuthType, Capabilities, ClientToolDefinition, CommandSource, CostReporting, Harness,
    HarnessId, HarnessMeta, InstallStatus, McpServerConfig, ModelInfo, QueryMode, QueryOptions,
    SlashCommand, ThinkingLevel,
};
pub use query::{EventReceiver, QueryContext, QueryControl, QueryHandle};
