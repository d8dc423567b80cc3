//! Durable store: transactional persistence for workflows, steps,
//! executions, step executions and logs.
//!
//! [`WorkflowStore`] is the single seam between the services/orchestrator
//! and whatever actually holds the data. Two implementations ship:
//! [`memory::InMemoryWorkflowStore`] (tests, small deployments) and
//! [`postgres::PostgresWorkflowStore`] (production, via `sqlx`).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::execution::{ExecutionStatus, StepExecutionStatus};
use crate::domain::log::LogLevel;
use crate::domain::workflow::WorkflowStatus;
use crate::domain::{ExecutionLog, StepExecution, Workflow, WorkflowExecution, WorkflowStep};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("step execution not found: {0}")]
    StepExecutionNotFound(Uuid),

    #[error("name collision: a workflow named '{0}' already exists")]
    NameCollision(String),

    #[error("duplicate execution for (workflow_id={workflow_id}, idempotency_key={idempotency_key})")]
    DuplicateExecution {
        workflow_id: Uuid,
        idempotency_key: String,
        existing: Box<WorkflowExecution>,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Offset/limit pagination.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: 100, offset: 0 }
    }
}

/// Filters accepted by `list_executions`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
}

/// Partial update applied to a [`WorkflowExecution`] by
/// `update_execution_status`. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStatusUpdate {
    pub status: Option<ExecutionStatus>,
    pub current_step_order: Option<i32>,
    pub error_message: Option<Option<String>>,
    pub output_data: Option<Option<Value>>,
}

/// Partial update applied to a [`StepExecution`] by
/// `update_step_execution`.
#[derive(Debug, Clone, Default)]
pub struct StepExecutionUpdate {
    pub status: Option<StepExecutionStatus>,
    pub output_data: Option<Option<Value>>,
    pub error_message: Option<Option<String>>,
    pub error_details: Option<Option<Value>>,
}

#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // -- Workflow --------------------------------------------------------

    async fn create_workflow(&self, workflow: Workflow, steps: Vec<WorkflowStep>) -> Result<Workflow, StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError>;

    async fn get_workflow_by_name(&self, name: &str) -> Result<Workflow, StoreError>;

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        pagination: Pagination,
    ) -> Result<Vec<Workflow>, StoreError>;

    async fn update_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> Result<Workflow, StoreError>;

    // -- Step --------------------------------------------------------------

    async fn add_step(&self, step: WorkflowStep) -> Result<WorkflowStep, StoreError>;

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError>;

    // -- Execution -----------------------------------------------------------

    async fn create_execution(&self, execution: WorkflowExecution) -> Result<WorkflowExecution, StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError>;

    async fn find_execution_by_idempotency_key(
        &self,
        workflow_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    async fn update_execution_status(
        &self,
        id: Uuid,
        update: ExecutionStatusUpdate,
    ) -> Result<WorkflowExecution, StoreError>;

    /// Atomically increments `retry_count` and returns the new value.
    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, StoreError>;

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Executions in `pending` whose `scheduled_at` is null or already due.
    async fn list_pending_ready(&self, now: DateTime<Utc>, pagination: Pagination) -> Result<Vec<WorkflowExecution>, StoreError>;

    // -- StepExecution -------------------------------------------------------

    async fn create_step_execution(&self, step_execution: StepExecution) -> Result<StepExecution, StoreError>;

    async fn update_step_execution(
        &self,
        id: Uuid,
        update: StepExecutionUpdate,
    ) -> Result<StepExecution, StoreError>;

    async fn list_step_executions(&self, execution_id: Uuid) -> Result<Vec<StepExecution>, StoreError>;

    // -- Log -----------------------------------------------------------------

    async fn append_log(&self, log: ExecutionLog) -> Result<ExecutionLog, StoreError>;

    async fn list_logs(
        &self,
        execution_id: Uuid,
        level: Option<LogLevel>,
        pagination: Pagination,
    ) -> Result<Vec<ExecutionLog>, StoreError>;

    // -- Observability ---------------------------------------------------

    async fn health_check(&self) -> Result<(), StoreError>;
}

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
