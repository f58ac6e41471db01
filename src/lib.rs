// ABOUTME: Root library module for the harnex binary
// ABOUTME: Exposes config, logging and paths; re-exports the agent and core crates

pub mod config;
pub mod logging;
pub mod paths;

// Re-export harnex-agent and harnex-core types for convenience
pub use harnex_agent::{Harness, HarnessCatalog, HarnessId, QueryOptions};
pub use harnex_core::{Execution, ExecutionRegistry, ExecutionStatus, QueryHost, StartRequest};
