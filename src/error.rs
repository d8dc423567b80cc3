//! Crate-wide error taxonomy
//!
//! Errors are grouped by *kind*, not by the module that raised them, so a
//! caller sitting on top of this crate (an HTTP layer, a CLI) can match on
//! `CoreError` once and route every component's failures the same way.

use uuid::Uuid;

use crate::domain::WorkflowExecution;
use crate::queue::QueueError;
use crate::state_machine::ExecutionStatus;
use crate::store::StoreError;

/// Unified error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Caller-supplied input fails a validation rule. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotency collision on execution creation. Not an error for the
    /// caller — the existing record is returned as-is (HTTP 200, not 201).
    #[error("duplicate execution for idempotency key '{idempotency_key}'")]
    DuplicateExecution {
        idempotency_key: String,
        existing: Box<WorkflowExecution>,
    },

    /// An illegal state-machine transition was requested.
    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// A step exhausted its retries.
    #[error("step '{step_name}' failed: {message}")]
    StepExecution { step_name: String, message: String },

    /// Unexpected orchestrator-internal failure.
    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    /// Durable store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Task queue failure.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl CoreError {
    pub fn not_found(entity: &str, id: Uuid) -> Self {
        Self::NotFound(format!("{entity} {id}"))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
