//! Workflow definition lifecycle: draft → active → deprecated/archived.

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::workflow::{is_contiguous, WorkflowStatus};
use crate::domain::{Workflow, WorkflowStep};
use crate::error::CoreError;
use crate::store::{Pagination, StoreError, WorkflowStore};

pub struct WorkflowService<S: WorkflowStore> {
    store: Arc<S>,
}

impl<S: WorkflowStore> WorkflowService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, metadata))]
    pub async fn create_workflow(
        &self,
        name: &str,
        description: Option<String>,
        metadata: Option<Value>,
    ) -> Result<Workflow, CoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("workflow name must not be empty"));
        }

        if self.store.get_workflow_by_name(name).await.is_ok() {
            return Err(CoreError::validation(format!("workflow name '{name}' already exists")));
        }

        let workflow = Workflow::new(name, description, metadata.unwrap_or_else(|| Value::Object(Default::default())));
        self.store
            .create_workflow(workflow, vec![])
            .await
            .map_err(|err| match err {
                StoreError::NameCollision(n) => CoreError::validation(format!("workflow name '{n}' already exists")),
                other => other.into(),
            })
    }

    #[instrument(skip(self, config))]
    #[allow(clippy::too_many_arguments)]
    pub async fn add_step(
        &self,
        workflow_id: Uuid,
        name: &str,
        task_type: &str,
        step_order: i32,
        config: Option<Value>,
        timeout_seconds: Option<i32>,
        max_retries: Option<i32>,
    ) -> Result<WorkflowStep, CoreError> {
        let workflow = self.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Draft {
            return Err(CoreError::validation("steps can only be added while the workflow is in draft"));
        }
        if name.trim().is_empty() || task_type.trim().is_empty() {
            return Err(CoreError::validation("step name and task_type must not be empty"));
        }
        if step_order < 0 {
            return Err(CoreError::validation("step_order must be non-negative"));
        }

        let existing_steps = self.store.list_steps(workflow_id).await?;
        if existing_steps.iter().any(|s| s.step_order == step_order) {
            return Err(CoreError::validation(format!("step_order {step_order} is already taken")));
        }

        let step = WorkflowStep::new(
            workflow_id,
            name,
            task_type,
            step_order,
            config.unwrap_or_else(|| Value::Object(Default::default())),
            timeout_seconds.unwrap_or(300),
            max_retries.unwrap_or(1),
        );
        Ok(self.store.add_step(step).await?)
    }

    #[instrument(skip(self))]
    pub async fn activate_workflow(&self, workflow_id: Uuid) -> Result<Workflow, CoreError> {
        let workflow = self.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Draft {
            return Err(CoreError::validation("only draft workflows can be activated"));
        }

        let steps = self.store.list_steps(workflow_id).await?;
        let orders: Vec<i32> = steps.iter().map(|s| s.step_order).collect();
        if !is_contiguous(&orders) {
            return Err(CoreError::validation("workflow step orders must be contiguous and non-empty"));
        }

        Ok(self.store.update_workflow_status(workflow_id, WorkflowStatus::Active).await?)
    }

    #[instrument(skip(self))]
    pub async fn deprecate_workflow(&self, workflow_id: Uuid) -> Result<Workflow, CoreError> {
        let workflow = self.get_workflow(workflow_id).await?;
        if !matches!(workflow.status, WorkflowStatus::Draft | WorkflowStatus::Active) {
            return Err(CoreError::validation("only draft or active workflows can be deprecated"));
        }
        Ok(self.store.update_workflow_status(workflow_id, WorkflowStatus::Deprecated).await?)
    }

    #[instrument(skip(self))]
    pub async fn archive_workflow(&self, workflow_id: Uuid) -> Result<Workflow, CoreError> {
        self.get_workflow(workflow_id).await?;
        Ok(self.store.update_workflow_status(workflow_id, WorkflowStatus::Archived).await?)
    }

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, CoreError> {
        self.store
            .get_workflow(workflow_id)
            .await
            .map_err(|_| CoreError::not_found("workflow", workflow_id))
    }

    pub async fn get_workflow_by_name(&self, name: &str) -> Result<Workflow, CoreError> {
        self.store
            .get_workflow_by_name(name)
            .await
            .map_err(|_| CoreError::Validation(format!("workflow '{name}' not found")))
    }

    pub async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        pagination: Pagination,
    ) -> Result<Vec<Workflow>, CoreError> {
        Ok(self.store.list_workflows(status, pagination).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryWorkflowStore;

    fn service() -> WorkflowService<InMemoryWorkflowStore> {
        WorkflowService::new(Arc::new(InMemoryWorkflowStore::new()))
    }

    #[tokio::test]
    async fn create_reject_blank_name() {
        let service = service();
        let err = service.create_workflow("   ", None, None).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn add_step_requires_draft() {
        let service = service();
        let workflow = service.create_workflow("wf", None, None).await.unwrap();
        service
            .add_step(workflow.id, "s0", "log", 0, None, None, None)
            .await
            .unwrap();
        service.activate_workflow(workflow.id).await.unwrap();

        let err = service
            .add_step(workflow.id, "s1", "log", 1, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn activate_requires_contiguous_steps() {
        let service = service();
        let workflow = service.create_workflow("wf", None, None).await.unwrap();
        service
            .add_step(workflow.id, "s0", "log", 0, None, None, None)
            .await
            .unwrap();
        service
            .add_step(workflow.id, "s2", "log", 2, None, None, None)
            .await
            .unwrap();

        let err = service.activate_workflow(workflow.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn activate_requires_at_least_one_step() {
        let service = service();
        let workflow = service.create_workflow("wf", None, None).await.unwrap();
        let err = service.activate_workflow(workflow.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let service = service();
        let workflow = service.create_workflow("wf", None, None).await.unwrap();
        service
            .add_step(workflow.id, "s0", "log", 0, None, None, None)
            .await
            .unwrap();
        let active = service.activate_workflow(workflow.id).await.unwrap();
        assert_eq!(active.status, WorkflowStatus::Active);

        let deprecated = service.deprecate_workflow(workflow.id).await.unwrap();
        assert_eq!(deprecated.status, WorkflowStatus::Deprecated);

        let archived = service.archive_workflow(workflow.id).await.unwrap();
        assert_eq!(archived.status, WorkflowStatus::Archived);
    }
}
