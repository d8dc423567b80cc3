//! Execution lifecycle: create/retry/cancel executions, validate
//! transitions through the state machine, append audit logs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::log::LogLevel;
use crate::domain::{ExecutionLog, StepExecution, WorkflowExecution};
use crate::error::CoreError;
use crate::state_machine::{self, ExecutionStatus};
use crate::store::{
    ExecutionFilter, ExecutionStatusUpdate, Pagination, StepExecutionUpdate, StoreError, WorkflowStore,
};
use crate::workflow_service::WorkflowService;

pub struct ExecutionService<S: WorkflowStore> {
    store: Arc<S>,
}

impl<S: WorkflowStore> ExecutionService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, input_data))]
    pub async fn create_execution(
        &self,
        workflow_id: Uuid,
        idempotency_key: &str,
        input_data: Option<Value>,
        max_retries: Option<i32>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<WorkflowExecution, CoreError> {
        let workflow_service = WorkflowService::new(Arc::clone(&self.store));
        let workflow = workflow_service.get_workflow(workflow_id).await?;
        if workflow.status != crate::domain::workflow::WorkflowStatus::Active {
            return Err(CoreError::validation("workflow must be active to create an execution"));
        }

        let execution = WorkflowExecution::new(
            workflow_id,
            idempotency_key,
            input_data.unwrap_or_else(|| Value::Object(Default::default())),
            max_retries.unwrap_or(3),
            scheduled_at,
        );

        match self.store.create_execution(execution).await {
            Ok(created) => {
                self.append_log(created.id, None, LogLevel::Info, "execution created", None)
                    .await?;
                Ok(created)
            }
            Err(StoreError::DuplicateExecution {
                idempotency_key,
                existing,
                ..
            }) => Err(CoreError::DuplicateExecution {
                idempotency_key,
                existing,
            }),
            Err(other) => Err(other.into()),
        }
    }

    #[instrument(skip(self))]
    pub async fn transition_status(
        &self,
        execution_id: Uuid,
        new_status: ExecutionStatus,
        error_message: Option<String>,
        current_step_order: Option<i32>,
    ) -> Result<WorkflowExecution, CoreError> {
        let execution = self.get_execution(execution_id).await?;
        state_machine::validate(execution.status, new_status)
            .map_err(|_| CoreError::InvalidTransition { from: execution.status, to: new_status })?;

        let updated = self
            .store
            .update_execution_status(
                execution_id,
                ExecutionStatusUpdate {
                    status: Some(new_status),
                    current_step_order,
                    error_message: error_message.clone().map(Some),
                    output_data: None,
                },
            )
            .await?;

        self.append_log(
            execution_id,
            None,
            LogLevel::Info,
            format!("transitioned {:?} -> {:?}", execution.status, new_status),
            error_message.map(|m| serde_json::json!({ "error_message": m })),
        )
        .await?;

        Ok(updated)
    }

    pub async fn start_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, CoreError> {
        self.transition_status(execution_id, ExecutionStatus::Running, None, None).await
    }

    pub async fn complete_execution(&self, execution_id: Uuid, output_data: Value) -> Result<WorkflowExecution, CoreError> {
        let execution = self.get_execution(execution_id).await?;
        state_machine::validate(execution.status, ExecutionStatus::Completed)
            .map_err(|_| CoreError::InvalidTransition { from: execution.status, to: ExecutionStatus::Completed })?;

        let updated = self
            .store
            .update_execution_status(
                execution_id,
                ExecutionStatusUpdate {
                    status: Some(ExecutionStatus::Completed),
                    current_step_order: None,
                    error_message: None,
                    output_data: Some(Some(output_data)),
                },
            )
            .await?;
        self.append_log(execution_id, None, LogLevel::Info, "execution completed", None).await?;
        Ok(updated)
    }

    pub async fn fail_execution(&self, execution_id: Uuid, error_message: impl Into<String>) -> Result<WorkflowExecution, CoreError> {
        let message = error_message.into();
        let updated = self.transition_status(execution_id, ExecutionStatus::Failed, Some(message.clone()), None).await?;
        self.append_log(execution_id, None, LogLevel::Error, message, None).await?;
        Ok(updated)
    }

    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, CoreError> {
        let execution = self.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(CoreError::validation("cannot cancel an execution already in a terminal state"));
        }
        self.transition_status(execution_id, ExecutionStatus::Cancelled, None, None).await
    }

    #[instrument(skip(self))]
    pub async fn retry_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, CoreError> {
        let execution = self.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Failed {
            return Err(CoreError::validation("only failed executions can be retried"));
        }
        if execution.retry_count >= execution.max_retries {
            return Err(CoreError::validation("retry budget exhausted"));
        }

        self.store.increment_retry_count(execution_id).await?;
        let updated = self.transition_status(execution_id, ExecutionStatus::Retrying, None, None).await?;
        self.append_log(execution_id, None, LogLevel::Info, "execution scheduled for retry", None).await?;
        Ok(updated)
    }

    pub async fn create_step_execution(&self, step_execution: StepExecution) -> Result<StepExecution, CoreError> {
        Ok(self.store.create_step_execution(step_execution).await?)
    }

    pub async fn update_step_execution(
        &self,
        id: Uuid,
        update: StepExecutionUpdate,
    ) -> Result<StepExecution, CoreError> {
        Ok(self.store.update_step_execution(id, update).await?)
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, CoreError> {
        self.store
            .get_execution(execution_id)
            .await
            .map_err(|_| CoreError::not_found("execution", execution_id))
    }

    pub async fn list_executions(
        &self,
        filter: ExecutionFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowExecution>, CoreError> {
        Ok(self.store.list_executions(filter, pagination).await?)
    }

    pub async fn get_execution_logs(
        &self,
        execution_id: Uuid,
        level: Option<LogLevel>,
        pagination: Pagination,
    ) -> Result<Vec<ExecutionLog>, CoreError> {
        self.get_execution(execution_id).await?;
        Ok(self.store.list_logs(execution_id, level, pagination).await?)
    }

    async fn append_log(
        &self,
        execution_id: Uuid,
        step_execution_id: Option<Uuid>,
        level: LogLevel,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Result<(), CoreError> {
        self.store
            .append_log(ExecutionLog::new(execution_id, step_execution_id, level, message, details))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryWorkflowStore;
    use crate::workflow_service::WorkflowService;
    use serde_json::json;

    async fn active_workflow(store: &Arc<InMemoryWorkflowStore>) -> Uuid {
        let workflow_service = WorkflowService::new(Arc::clone(store));
        let workflow = workflow_service.create_workflow("wf", None, None).await.unwrap();
        workflow_service
            .add_step(workflow.id, "s0", "log", 0, None, None, None)
            .await
            .unwrap();
        workflow_service.activate_workflow(workflow.id).await.unwrap();
        workflow.id
    }

    #[tokio::test]
    async fn create_execution_is_idempotent() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let workflow_id = active_workflow(&store).await;
        let service = ExecutionService::new(Arc::clone(&store));

        let first = service
            .create_execution(workflow_id, "k1", Some(json!({})), None, None)
            .await
            .unwrap();

        let err = service
            .create_execution(workflow_id, "k1", Some(json!({})), None, None)
            .await
            .unwrap_err();
        match err {
            CoreError::DuplicateExecution { existing, .. } => assert_eq!(existing.id, first.id),
            other => panic!("expected DuplicateExecution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_requires_failed_status() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let workflow_id = active_workflow(&store).await;
        let service = ExecutionService::new(Arc::clone(&store));
        let execution = service.create_execution(workflow_id, "k1", None, Some(3), None).await.unwrap();

        let err = service.retry_execution(execution.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn cancel_refuses_terminal_execution() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let workflow_id = active_workflow(&store).await;
        let service = ExecutionService::new(Arc::clone(&store));
        let execution = service.create_execution(workflow_id, "k1", None, None, None).await.unwrap();

        service.start_execution(execution.id).await.unwrap();
        service.complete_execution(execution.id, json!({})).await.unwrap();

        let err = service.cancel_execution(execution.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn retry_count_never_exceeds_max() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let workflow_id = active_workflow(&store).await;
        let service = ExecutionService::new(Arc::clone(&store));
        let execution = service.create_execution(workflow_id, "k1", None, Some(1), None).await.unwrap();

        service.start_execution(execution.id).await.unwrap();
        service.fail_execution(execution.id, "boom").await.unwrap();
        service.retry_execution(execution.id).await.unwrap();
        service.transition_status(execution.id, ExecutionStatus::Running, None, None).await.unwrap();
        service.fail_execution(execution.id, "boom again").await.unwrap();

        let err = service.retry_execution(execution.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
