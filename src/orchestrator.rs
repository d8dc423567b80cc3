//! The execution engine: drives one [`WorkflowExecution`] step-by-step,
//! applying per-step retries with exponential backoff, checkpointing
//! progress after every step so a crashed worker can resume without
//! re-running completed steps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::execution::StepExecutionStatus;
use crate::domain::log::LogLevel;
use crate::domain::{StepExecution, WorkflowExecution, WorkflowStep};
use crate::error::CoreError;
use crate::execution_service::ExecutionService;
use crate::handler::TaskHandlerRegistry;
use crate::retry::RetryPolicy;
use crate::state_machine::ExecutionStatus;
use crate::store::{StepExecutionUpdate, WorkflowStore};

/// Outcome of driving an execution to either a terminal state or a
/// benign early return (already completed, cancelled).
#[derive(Debug, Clone)]
pub enum OrchestratorOutcome {
    AlreadyCompleted { output_data: Option<Value> },
    Completed { output_data: Value },
    Failed { execution_id: Uuid },
    Cancelled { execution_id: Uuid },
}

/// A step ran out of retries. Callers observe this only as a
/// transition of the owning execution to `failed` — it never escapes
/// the worker loop.
#[derive(Debug, thiserror::Error)]
#[error("step '{step_name}' failed: {message}")]
struct StepExecutionError {
    step_name: String,
    message: String,
}

pub struct Orchestrator<S: WorkflowStore> {
    store: Arc<S>,
    executions: ExecutionService<S>,
    registry: Arc<TaskHandlerRegistry>,
    retry_policy: RetryPolicy,
}

impl<S: WorkflowStore> Orchestrator<S> {
    pub fn new(store: Arc<S>, registry: Arc<TaskHandlerRegistry>, retry_policy: RetryPolicy) -> Self {
        let executions = ExecutionService::new(Arc::clone(&store));
        Self {
            store,
            executions,
            registry,
            retry_policy,
        }
    }

    /// Drives `execution_id` from its current checkpoint to completion,
    /// failure, or a benign early return.
    #[instrument(skip(self))]
    pub async fn execute(&self, execution_id: Uuid) -> Result<OrchestratorOutcome, CoreError> {
        let execution = self.executions.get_execution(execution_id).await?;
        let workflow = self.store.get_workflow(execution.workflow_id).await.map_err(|_| {
            CoreError::Orchestrator(format!("workflow {} missing for execution {}", execution.workflow_id, execution_id))
        })?;

        if execution.status == ExecutionStatus::Completed {
            return Ok(OrchestratorOutcome::AlreadyCompleted { output_data: execution.output_data });
        }
        if execution.status == ExecutionStatus::Cancelled {
            return Err(CoreError::Orchestrator(format!(
                "execution {execution_id} is already cancelled"
            )));
        }

        if matches!(execution.status, ExecutionStatus::Pending | ExecutionStatus::Retrying) {
            self.executions.start_execution(execution_id).await?;
        }

        let mut steps = self.store.list_steps(workflow.id).await?;
        steps.retain(|s| s.step_order >= execution.current_step_order);
        steps.sort_by_key(|s| s.step_order);

        let mut current_data = execution.input_data.clone();
        let mut step_outputs: BTreeMap<String, Value> = BTreeMap::new();

        for step in &steps {
            match self.execute_step(execution_id, step, &current_data).await {
                Ok(output) => {
                    if let Some(output) = &output {
                        step_outputs.insert(step.name.clone(), output.clone());
                        merge_into(&mut current_data, output);
                    }
                    self.store
                        .update_execution_status(
                            execution_id,
                            crate::store::ExecutionStatusUpdate {
                                status: None,
                                current_step_order: Some(step.step_order + 1),
                                error_message: None,
                                output_data: None,
                            },
                        )
                        .await?;
                }
                Err(step_error) => {
                    let message = format!("step '{}' failed: {}", step_error.step_name, step_error.message);
                    match self.executions.fail_execution(execution_id, message).await {
                        Ok(_) => return Ok(OrchestratorOutcome::Failed { execution_id }),
                        Err(CoreError::InvalidTransition { .. }) => {
                            // The execution moved to cancelled underneath us
                            // (cooperative cancellation). Not an orchestrator
                            // fault — treat it as a benign terminal outcome.
                            return Ok(OrchestratorOutcome::Cancelled { execution_id });
                        }
                        Err(other) => return Err(other),
                    }
                }
            }
        }

        let final_output = serde_json::json!({
            "steps": step_outputs,
            "final_data": current_data,
        });

        match self.executions.complete_execution(execution_id, final_output.clone()).await {
            Ok(_) => Ok(OrchestratorOutcome::Completed { output_data: final_output }),
            Err(CoreError::InvalidTransition { .. }) => Ok(OrchestratorOutcome::Cancelled { execution_id }),
            Err(other) => Err(other),
        }
    }

    /// Runs one step to completion or exhaustion, retrying on error with
    /// exponential backoff. Each attempt gets its own [`StepExecution`]
    /// row, ordered by `(step_order, attempt_number)`, so the audit trail
    /// shows every failed attempt alongside the one that finally
    /// succeeded or the last one to exhaust retries. Returns the step's
    /// output (or `None` if the handler produced nothing to merge).
    #[instrument(skip(self, input_data), fields(step_name = %step.name))]
    async fn execute_step(
        &self,
        execution_id: Uuid,
        step: &WorkflowStep,
        input_data: &Value,
    ) -> Result<Option<Value>, StepExecutionError> {
        let handler = match self.registry.get_handler(&step.task_type) {
            Some(handler) => handler,
            None => {
                let step_execution = StepExecution::new(execution_id, step.id, step.step_order, 1, input_data.clone());
                let id = step_execution.id;
                self.store
                    .create_step_execution(step_execution)
                    .await
                    .map_err(|e| step_store_error(step, e))?;
                self.store
                    .update_step_execution(
                        id,
                        StepExecutionUpdate {
                            status: Some(StepExecutionStatus::Failed),
                            error_message: Some(Some(format!("no handler registered for task_type '{}'", step.task_type))),
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| step_store_error(step, e))?;
                return Err(StepExecutionError {
                    step_name: step.name.clone(),
                    message: format!("no handler registered for task_type '{}'", step.task_type),
                });
            }
        };

        let mut last_error: Option<String> = None;

        for attempt in 1..=step.max_retries {
            let step_execution = StepExecution::new(execution_id, step.id, step.step_order, attempt, input_data.clone());
            let step_execution_id = step_execution.id;
            self.store
                .create_step_execution(step_execution)
                .await
                .map_err(|e| step_store_error(step, e))?;

            self.store
                .update_step_execution(
                    step_execution_id,
                    StepExecutionUpdate {
                        status: Some(StepExecutionStatus::Running),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| step_store_error(step, e))?;
            self.log(
                execution_id,
                Some(step_execution_id),
                LogLevel::Info,
                format!("starting step '{}' (attempt {}/{})", step.name, attempt, step.max_retries),
            )
            .await
            .map_err(|e| step_store_error(step, e))?;

            let timeout = Duration::from_secs(step.timeout_seconds.max(0) as u64);
            match handler.execute(&step.config, input_data, timeout).await {
                Ok(output) => {
                    self.store
                        .update_step_execution(
                            step_execution_id,
                            StepExecutionUpdate {
                                status: Some(StepExecutionStatus::Completed),
                                output_data: Some(output.clone()),
                                ..Default::default()
                            },
                        )
                        .await
                        .map_err(|e| step_store_error(step, e))?;
                    info!(step = %step.name, attempt, "step completed");
                    return Ok(output);
                }
                Err(handler_error) => {
                    last_error = Some(handler_error.message.clone());
                    error!(
                        step = %step.name,
                        attempt,
                        error_type = ?handler_error.error_type,
                        error = %handler_error.message,
                        "step attempt failed"
                    );

                    self.store
                        .update_step_execution(
                            step_execution_id,
                            StepExecutionUpdate {
                                status: Some(StepExecutionStatus::Failed),
                                error_message: Some(Some(handler_error.message.clone())),
                                ..Default::default()
                            },
                        )
                        .await
                        .map_err(|e| step_store_error(step, e))?;

                    if attempt < step.max_retries {
                        let delay = self.retry_policy.delay_for_attempt(attempt);
                        warn!(step = %step.name, attempt, delay_secs = delay.as_secs_f64(), "retrying after backoff");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(StepExecutionError {
            step_name: step.name.clone(),
            message: last_error.unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    async fn log(
        &self,
        execution_id: Uuid,
        step_execution_id: Option<Uuid>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<(), crate::store::StoreError> {
        self.store
            .append_log(crate::domain::ExecutionLog::new(execution_id, step_execution_id, level, message, None))
            .await?;
        Ok(())
    }
}

fn step_store_error(step: &WorkflowStep, e: crate::store::StoreError) -> StepExecutionError {
    StepExecutionError {
        step_name: step.name.clone(),
        message: format!("store error: {e}"),
    }
}

/// Shallow-merges `output`'s top-level keys into `current_data`, matching
/// the original's `current_data.update(output)` dict-update semantics.
/// Non-object outputs are ignored — there is nothing sensible to merge.
fn merge_into(current_data: &mut Value, output: &Value) {
    if let (Value::Object(current), Value::Object(new)) = (current_data, output) {
        for (key, value) in new {
            current.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::workflow::WorkflowStatus;
    use crate::handler::{HandlerError, TaskHandler};
    use crate::store::InMemoryWorkflowStore;
    use crate::workflow_service::WorkflowService;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct LoggingHandler;

    #[async_trait]
    impl TaskHandler for LoggingHandler {
        fn task_type(&self) -> &str {
            "log"
        }

        async fn execute(&self, step_config: &Value, _input_data: &Value, _timeout: Duration) -> Result<Option<Value>, HandlerError> {
            let message = step_config.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string();
            Ok(Some(json!({ "logged_message": message, "level": "info" })))
        }
    }

    struct FlakyHandler {
        calls: AtomicUsize,
        fail_until: usize,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        fn task_type(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _step_config: &Value, _input_data: &Value, _timeout: Duration) -> Result<Option<Value>, HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_until {
                Err(HandlerError::new("flaky failure"))
            } else {
                Ok(Some(json!({ "ok": true })))
            }
        }
    }

    struct AlwaysFailHandler;

    #[async_trait]
    impl TaskHandler for AlwaysFailHandler {
        fn task_type(&self) -> &str {
            "always_fail"
        }

        async fn execute(&self, _step_config: &Value, _input_data: &Value, _timeout: Duration) -> Result<Option<Value>, HandlerError> {
            Err(HandlerError::new("nope"))
        }
    }

    async fn setup(registry: TaskHandlerRegistry) -> (Arc<InMemoryWorkflowStore>, Orchestrator<InMemoryWorkflowStore>) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            Arc::new(registry),
            RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(50)),
        );
        (store, orchestrator)
    }

    #[tokio::test]
    async fn happy_path_s1() {
        let mut registry = TaskHandlerRegistry::new();
        registry.register(Arc::new(LoggingHandler));
        let (store, orchestrator) = setup(registry).await;

        let workflow_service = WorkflowService::new(Arc::clone(&store));
        let workflow = workflow_service.create_workflow("W", None, None).await.unwrap();
        workflow_service
            .add_step(workflow.id, "s0", "log", 0, Some(json!({"message": "hi"})), None, None)
            .await
            .unwrap();
        workflow_service.activate_workflow(workflow.id).await.unwrap();
        assert_eq!(workflow_service.get_workflow(workflow.id).await.unwrap().status, WorkflowStatus::Active);

        let executions = ExecutionService::new(Arc::clone(&store));
        let execution = executions.create_execution(workflow.id, "k1", Some(json!({})), None, None).await.unwrap();

        let outcome = orchestrator.execute(execution.id).await.unwrap();
        match outcome {
            OrchestratorOutcome::Completed { output_data } => {
                assert_eq!(output_data["steps"]["s0"]["logged_message"], "hi");
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let final_execution = executions.get_execution(execution.id).await.unwrap();
        assert_eq!(final_execution.status, ExecutionStatus::Completed);

        let step_executions = store.list_step_executions(execution.id).await.unwrap();
        assert_eq!(step_executions.len(), 1);
        assert_eq!(step_executions[0].attempt_number, 1);
        assert_eq!(step_executions[0].status, StepExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn retry_then_succeed_s2() {
        let mut registry = TaskHandlerRegistry::new();
        registry.register(Arc::new(FlakyHandler { calls: AtomicUsize::new(0), fail_until: 1 }));
        let (store, orchestrator) = setup(registry).await;

        let workflow_service = WorkflowService::new(Arc::clone(&store));
        let workflow = workflow_service.create_workflow("W", None, None).await.unwrap();
        workflow_service
            .add_step(workflow.id, "s0", "flaky", 0, None, None, Some(3))
            .await
            .unwrap();
        workflow_service.activate_workflow(workflow.id).await.unwrap();

        let executions = ExecutionService::new(Arc::clone(&store));
        let execution = executions.create_execution(workflow.id, "k1", None, None, None).await.unwrap();

        let outcome = orchestrator.execute(execution.id).await.unwrap();
        assert!(matches!(outcome, OrchestratorOutcome::Completed { .. }));

        let final_execution = executions.get_execution(execution.id).await.unwrap();
        assert_eq!(final_execution.status, ExecutionStatus::Completed);

        let mut step_executions = store.list_step_executions(execution.id).await.unwrap();
        step_executions.sort_by_key(|s| s.attempt_number);
        assert_eq!(step_executions.len(), 2, "one failed attempt then one completed attempt");
        assert_eq!(step_executions[0].attempt_number, 1);
        assert_eq!(step_executions[0].status, StepExecutionStatus::Failed);
        assert_eq!(step_executions[1].attempt_number, 2);
        assert_eq!(step_executions[1].status, StepExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn retry_exhaustion_s3() {
        let mut registry = TaskHandlerRegistry::new();
        registry.register(Arc::new(AlwaysFailHandler));
        let (store, orchestrator) = setup(registry).await;

        let workflow_service = WorkflowService::new(Arc::clone(&store));
        let workflow = workflow_service.create_workflow("W", None, None).await.unwrap();
        workflow_service
            .add_step(workflow.id, "s0", "always_fail", 0, None, None, Some(2))
            .await
            .unwrap();
        workflow_service.activate_workflow(workflow.id).await.unwrap();

        let executions = ExecutionService::new(Arc::clone(&store));
        let execution = executions.create_execution(workflow.id, "k1", None, None, None).await.unwrap();

        let outcome = orchestrator.execute(execution.id).await.unwrap();
        assert!(matches!(outcome, OrchestratorOutcome::Failed { .. }));

        let final_execution = executions.get_execution(execution.id).await.unwrap();
        assert_eq!(final_execution.status, ExecutionStatus::Failed);
        assert!(final_execution.error_message.unwrap().contains("s0"));

        let mut step_executions = store.list_step_executions(execution.id).await.unwrap();
        step_executions.sort_by_key(|s| s.attempt_number);
        assert_eq!(step_executions.len(), 2, "attempts 1 and 2, both failed");
        assert_eq!(step_executions[0].attempt_number, 1);
        assert_eq!(step_executions[1].attempt_number, 2);
        assert!(step_executions.iter().all(|s| s.status == StepExecutionStatus::Failed));
    }

    #[tokio::test]
    async fn resumability_s7() {
        let mut registry = TaskHandlerRegistry::new();
        registry.register(Arc::new(LoggingHandler));
        let (store, orchestrator) = setup(registry).await;

        let workflow_service = WorkflowService::new(Arc::clone(&store));
        let workflow = workflow_service.create_workflow("W", None, None).await.unwrap();
        workflow_service
            .add_step(workflow.id, "s0", "log", 0, Some(json!({"message": "a"})), None, None)
            .await
            .unwrap();
        workflow_service
            .add_step(workflow.id, "s1", "log", 1, Some(json!({"message": "b"})), None, None)
            .await
            .unwrap();
        workflow_service.activate_workflow(workflow.id).await.unwrap();

        let executions = ExecutionService::new(Arc::clone(&store));
        let execution = executions.create_execution(workflow.id, "k1", None, None, None).await.unwrap();

        // Simulate a crash right after step 0 committed: force current_step_order
        // forward and leave status running, as if a worker died mid-flight.
        executions.start_execution(execution.id).await.unwrap();
        store
            .update_execution_status(
                execution.id,
                crate::store::ExecutionStatusUpdate {
                    status: None,
                    current_step_order: Some(1),
                    error_message: None,
                    output_data: None,
                },
            )
            .await
            .unwrap();

        let outcome = orchestrator.execute(execution.id).await.unwrap();
        assert!(matches!(outcome, OrchestratorOutcome::Completed { .. }));

        let step_executions = store.list_step_executions(execution.id).await.unwrap();
        // only step s1 ran this time — s0 was skipped because current_step_order was 1
        assert_eq!(step_executions.len(), 1);
        assert_eq!(step_executions[0].step_order, 1);
    }

    #[tokio::test]
    async fn cancellation_s6_rediscovered_as_fatal() {
        // A worker re-dispatching an already-cancelled execution (the
        // cancellation landed before this attempt started) treats it as
        // a fatal, non-retryable orchestrator error rather than silently
        // resuming it.
        let mut registry = TaskHandlerRegistry::new();
        registry.register(Arc::new(LoggingHandler));
        let (store, orchestrator) = setup(registry).await;

        let workflow_service = WorkflowService::new(Arc::clone(&store));
        let workflow = workflow_service.create_workflow("W", None, None).await.unwrap();
        workflow_service
            .add_step(workflow.id, "s0", "log", 0, None, None, None)
            .await
            .unwrap();
        workflow_service.activate_workflow(workflow.id).await.unwrap();

        let executions = ExecutionService::new(Arc::clone(&store));
        let execution = executions.create_execution(workflow.id, "k1", None, None, None).await.unwrap();
        executions.start_execution(execution.id).await.unwrap();
        executions.cancel_execution(execution.id).await.unwrap();

        let err = orchestrator.execute(execution.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Orchestrator(_)));

        let final_execution = executions.get_execution(execution.id).await.unwrap();
        assert_eq!(final_execution.status, ExecutionStatus::Cancelled);
    }

}
