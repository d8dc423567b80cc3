//! In-memory [`WorkflowStore`]: one `RwLock<HashMap<_, _>>` per entity
//! kind, guarded by `parking_lot` for lock-free-under-contention reads.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::execution::ExecutionStatus;
use crate::domain::log::LogLevel;
use crate::domain::workflow::WorkflowStatus;
use crate::domain::{ExecutionLog, StepExecution, Workflow, WorkflowExecution, WorkflowStep};

use super::{
    ExecutionFilter, ExecutionStatusUpdate, Pagination, StepExecutionUpdate, StoreError, WorkflowStore,
};

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, Workflow>,
    steps: HashMap<Uuid, Vec<WorkflowStep>>,
    executions: HashMap<Uuid, WorkflowExecution>,
    step_executions: HashMap<Uuid, StepExecution>,
    logs: Vec<ExecutionLog>,
}

/// In-memory store. Cheap to clone (`Arc` inside), suitable for tests and
/// single-process deployments that don't need durability across restarts.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowStore {
    inner: std::sync::Arc<RwLock<Inner>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_count(&self) -> usize {
        self.inner.read().workflows.len()
    }

    pub fn execution_count(&self) -> usize {
        self.inner.read().executions.len()
    }

    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow(&self, workflow: Workflow, steps: Vec<WorkflowStep>) -> Result<Workflow, StoreError> {
        let mut inner = self.inner.write();
        if inner.workflows.values().any(|w| w.name == workflow.name) {
            return Err(StoreError::NameCollision(workflow.name));
        }
        inner.steps.insert(workflow.id, steps);
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        self.inner
            .read()
            .workflows
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Workflow, StoreError> {
        self.inner
            .read()
            .workflows
            .values()
            .filter(|w| w.name == name)
            .max_by_key(|w| w.version)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(Uuid::nil()))
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        pagination: Pagination,
    ) -> Result<Vec<Workflow>, StoreError> {
        let inner = self.inner.read();
        let mut matching: Vec<Workflow> = inner
            .workflows
            .values()
            .filter(|w| status.map(|s| s == w.status).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by_key(|w| w.created_at);
        Ok(paginate(matching, pagination))
    }

    async fn update_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> Result<Workflow, StoreError> {
        let mut inner = self.inner.write();
        let workflow = inner.workflows.get_mut(&id).ok_or(StoreError::WorkflowNotFound(id))?;
        workflow.status = status;
        workflow.updated_at = Utc::now();
        Ok(workflow.clone())
    }

    async fn add_step(&self, step: WorkflowStep) -> Result<WorkflowStep, StoreError> {
        let mut inner = self.inner.write();
        if !inner.workflows.contains_key(&step.workflow_id) {
            return Err(StoreError::WorkflowNotFound(step.workflow_id));
        }
        inner.steps.entry(step.workflow_id).or_default().push(step.clone());
        Ok(step)
    }

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError> {
        let inner = self.inner.read();
        let mut steps = inner.steps.get(&workflow_id).cloned().unwrap_or_default();
        steps.sort_by_key(|s| s.step_order);
        Ok(steps)
    }

    async fn create_execution(&self, execution: WorkflowExecution) -> Result<WorkflowExecution, StoreError> {
        let mut inner = self.inner.write();
        let collision = inner.executions.values().find(|e| {
            e.workflow_id == execution.workflow_id && e.idempotency_key == execution.idempotency_key
        });
        if let Some(existing) = collision {
            return Err(StoreError::DuplicateExecution {
                workflow_id: execution.workflow_id,
                idempotency_key: execution.idempotency_key,
                existing: Box::new(existing.clone()),
            });
        }
        inner.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.inner
            .read()
            .executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn find_execution_by_idempotency_key(
        &self,
        workflow_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self
            .inner
            .read()
            .executions
            .values()
            .find(|e| e.workflow_id == workflow_id && e.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn update_execution_status(
        &self,
        id: Uuid,
        update: ExecutionStatusUpdate,
    ) -> Result<WorkflowExecution, StoreError> {
        let mut inner = self.inner.write();
        let execution = inner.executions.get_mut(&id).ok_or(StoreError::ExecutionNotFound(id))?;

        if let Some(status) = update.status {
            if status == ExecutionStatus::Running && execution.started_at.is_none() {
                execution.started_at = Some(Utc::now());
            }
            if status.is_terminal() && execution.completed_at.is_none() {
                execution.completed_at = Some(Utc::now());
            }
            execution.status = status;
        }
        if let Some(order) = update.current_step_order {
            execution.current_step_order = execution.current_step_order.max(order);
        }
        if let Some(error_message) = update.error_message {
            execution.error_message = error_message;
        }
        if let Some(output_data) = update.output_data {
            execution.output_data = output_data;
        }
        execution.updated_at = Utc::now();
        Ok(execution.clone())
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, StoreError> {
        let mut inner = self.inner.write();
        let execution = inner.executions.get_mut(&id).ok_or(StoreError::ExecutionNotFound(id))?;
        execution.retry_count += 1;
        execution.updated_at = Utc::now();
        Ok(execution.retry_count)
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let inner = self.inner.read();
        let mut matching: Vec<WorkflowExecution> = inner
            .executions
            .values()
            .filter(|e| filter.workflow_id.map(|w| w == e.workflow_id).unwrap_or(true))
            .filter(|e| filter.status.map(|s| s == e.status).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.created_at);
        Ok(paginate(matching, pagination))
    }

    async fn list_pending_ready(
        &self,
        now: DateTime<Utc>,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let inner = self.inner.read();
        let mut matching: Vec<WorkflowExecution> = inner
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .filter(|e| e.scheduled_at.map(|t| t <= now).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.created_at);
        Ok(paginate(matching, pagination))
    }

    async fn create_step_execution(&self, step_execution: StepExecution) -> Result<StepExecution, StoreError> {
        let mut inner = self.inner.write();
        inner.step_executions.insert(step_execution.id, step_execution.clone());
        Ok(step_execution)
    }

    async fn update_step_execution(
        &self,
        id: Uuid,
        update: StepExecutionUpdate,
    ) -> Result<StepExecution, StoreError> {
        let mut inner = self.inner.write();
        let step_execution = inner
            .step_executions
            .get_mut(&id)
            .ok_or(StoreError::StepExecutionNotFound(id))?;

        if let Some(status) = update.status {
            use crate::domain::execution::StepExecutionStatus::*;
            if status == Running && step_execution.started_at.is_none() {
                step_execution.started_at = Some(Utc::now());
            }
            if matches!(status, Completed | Failed | Skipped) {
                step_execution.completed_at = Some(Utc::now());
            }
            step_execution.status = status;
        }
        if let Some(output_data) = update.output_data {
            step_execution.output_data = output_data;
        }
        if let Some(error_message) = update.error_message {
            step_execution.error_message = error_message;
        }
        if let Some(error_details) = update.error_details {
            step_execution.error_details = error_details;
        }
        Ok(step_execution.clone())
    }

    async fn list_step_executions(&self, execution_id: Uuid) -> Result<Vec<StepExecution>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<StepExecution> = inner
            .step_executions
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.step_order, s.attempt_number));
        Ok(rows)
    }

    async fn append_log(&self, log: ExecutionLog) -> Result<ExecutionLog, StoreError> {
        let mut inner = self.inner.write();
        inner.logs.push(log.clone());
        Ok(log)
    }

    async fn list_logs(
        &self,
        execution_id: Uuid,
        level: Option<LogLevel>,
        pagination: Pagination,
    ) -> Result<Vec<ExecutionLog>, StoreError> {
        let inner = self.inner.read();
        let matching: Vec<ExecutionLog> = inner
            .logs
            .iter()
            .filter(|l| l.execution_id == execution_id)
            .filter(|l| level.map(|lv| lv == l.level).unwrap_or(true))
            .cloned()
            .collect();
        Ok(paginate(matching, pagination))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn paginate<T>(items: Vec<T>, pagination: Pagination) -> Vec<T> {
    let offset = pagination.offset.max(0) as usize;
    let limit = pagination.limit.max(0) as usize;
    items.into_iter().skip(offset).take(limit).collect()
}
