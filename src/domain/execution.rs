//! Workflow executions and their per-step attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use crate::state_machine::ExecutionStatus;

/// One run of a [`crate::domain::workflow::Workflow`] definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub idempotency_key: String,
    pub status: ExecutionStatus,
    pub current_step_order: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: Uuid,
        idempotency_key: impl Into<String>,
        input_data: Value,
        max_retries: i32,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            idempotency_key: idempotency_key.into(),
            status: ExecutionStatus::Pending,
            current_step_order: 0,
            retry_count: 0,
            max_retries,
            input_data,
            output_data: None,
            error_message: None,
            scheduled_at,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `failed` is only terminal for routing purposes once the retry
    /// budget is exhausted — the state machine itself still allows
    /// `failed -> retrying`.
    pub fn is_terminal_for_routing(&self) -> bool {
        self.status.is_terminal()
            || (self.status == ExecutionStatus::Failed && self.retry_count >= self.max_retries)
    }
}

/// Status of one attempt of one step inside one [`WorkflowExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One attempt of one [`crate::domain::workflow::WorkflowStep`] within a
/// [`WorkflowExecution`]. Retries emit a fresh row each, all sharing
/// `(execution_id, step_id)` and totally ordered by `attempt_number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: Uuid,
    pub step_order: i32,
    pub status: StepExecutionStatus,
    pub attempt_number: i32,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn new(execution_id: Uuid, step_id: Uuid, step_order: i32, attempt_number: i32, input_data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_id,
            step_order,
            status: StepExecutionStatus::Pending,
            attempt_number,
            input_data,
            output_data: None,
            error_message: None,
            error_details: None,
            started_at: None,
            completed_at: None,
        }
    }
}
