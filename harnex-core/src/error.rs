// ABOUTME: Error types callers of the execution layer match on.
// ABOUTME: Plumbing failures stay anyhow; these enums mark the documented outcomes.

use harnex_agent::HarnessId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backend could not be launched; no registry entry was kept
    #[error("Could not start {harness} execution: {reason}")]
    CouldNotStart { harness: HarnessId, reason: String },

    /// Neither the registry nor the durable side knows this execution
    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error("Execution already exists: {0}")]
    AlreadyExists(String),

    #[error("Execution is already being attached: {0}")]
    AttachInProgress(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// Only one message sequence may be live per execution
    #[error("Execution {0} already has an active message consumer")]
    ConsumerActive(String),
}
