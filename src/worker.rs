//! Worker: dequeue loop with graceful shutdown, dispatching to the
//! [`Orchestrator`] and routing outcomes back to the queue. A
//! `watch::channel` shutdown signal is shared between the main loop and a
//! background recovery sweep, both woken early by `tokio::select!` rather
//! than sleeping through shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::orchestrator::{Orchestrator, OrchestratorOutcome};
use crate::queue::{Message, QueueError, RejectOutcome, TaskQueue};
use crate::store::WorkflowStore;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Tunables for the dequeue loop and background recovery sweep.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub dequeue_blocking_timeout: Duration,
    pub recovery_interval: Duration,
    pub max_delivery_attempts: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dequeue_blocking_timeout: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(60),
            max_delivery_attempts: 3,
        }
    }
}

/// Runs the dequeue loop and the recovery sweep, both cancellable via the
/// shared shutdown signal, until `shutdown()` is called.
pub struct Worker<S: WorkflowStore, Q: TaskQueue> {
    queue: Arc<Q>,
    orchestrator: Arc<Orchestrator<S>>,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: WorkflowStore, Q: TaskQueue> Worker<S, Q> {
    pub fn new(queue: Arc<Q>, orchestrator: Arc<Orchestrator<S>>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            queue,
            orchestrator,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Signals every running loop to stop at its next suspension point.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Runs the main dequeue loop until shutdown. Intended to be driven
    /// concurrently with [`Worker::run_recovery_loop`].
    #[instrument(skip(self))]
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                info!("worker shutting down");
                return;
            }

            let dequeued = tokio::select! {
                result = self.queue.dequeue(self.config.dequeue_blocking_timeout) => result,
                _ = shutdown_rx.changed() => {
                    info!("worker shutting down mid-dequeue");
                    return;
                }
            };

            match dequeued {
                Ok(Some(message)) => self.handle_message(message).await,
                Ok(None) => continue,
                Err(err) => {
                    error!(error = %err, "queue error in dequeue loop, pausing before retry");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Background sweep re-surfacing messages whose visibility timeout
    /// has lapsed. Cancellable on shutdown via the shared `watch` channel.
    #[instrument(skip(self))]
    pub async fn run_recovery_loop(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.recovery_interval) => {
                    match self.queue.recover_stale(self.config.max_delivery_attempts).await {
                        Ok(0) => {}
                        Ok(n) => warn!(recovered = n, "recovered stale in-flight messages"),
                        Err(err) => error!(error = %err, "recovery sweep failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("recovery loop shutting down");
                    return;
                }
            }
            if *shutdown_rx.borrow() {
                return;
            }
        }
    }

    async fn handle_message(&self, message: Message) {
        let execution_id = message.execution_id;
        match self.orchestrator.execute(execution_id).await {
            Ok(outcome) => {
                info!(execution_id = %execution_id, outcome = ?outcome_label(&outcome), "execution handled, acknowledging message");
                if let Err(err) = self.queue.acknowledge(message.id).await {
                    error!(error = %err, message_id = %message.id, "failed to acknowledge message");
                }
            }
            Err(err) => {
                warn!(error = %err, execution_id = %execution_id, "orchestrator raised an unexpected error, rejecting message");
                self.reject_message(message, err).await;
            }
        }
    }

    async fn reject_message(&self, message: Message, cause: CoreError) {
        let to_dlq = message.attempt >= self.config.max_delivery_attempts;
        let reason = format!("{cause}");
        match self.queue.reject(message.id, to_dlq, Some(reason)).await {
            Ok(RejectOutcome::MovedToDlq { reason }) => {
                error!(message_id = %message.id, reason = %reason, "message moved to dead-letter queue");
            }
            Ok(RejectOutcome::Requeued { attempt }) => {
                warn!(message_id = %message.id, attempt, "message requeued after failure");
            }
            Err(err) => error!(error = %err, message_id = %message.id, "failed to reject message"),
        }
    }
}

fn outcome_label(outcome: &OrchestratorOutcome) -> &'static str {
    match outcome {
        OrchestratorOutcome::AlreadyCompleted { .. } => "already_completed",
        OrchestratorOutcome::Completed { .. } => "completed",
        OrchestratorOutcome::Failed { .. } => "failed",
        OrchestratorOutcome::Cancelled { .. } => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_service::ExecutionService;
    use crate::handler::{HandlerError, TaskHandler};
    use crate::handler::TaskHandlerRegistry;
    use crate::queue::{EnqueueRequest, InMemoryTaskQueue};
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryWorkflowStore;
    use crate::workflow_service::WorkflowService;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct LoggingHandler;

    #[async_trait]
    impl TaskHandler for LoggingHandler {
        fn task_type(&self) -> &str {
            "log"
        }

        async fn execute(&self, _c: &Value, _i: &Value, _t: Duration) -> Result<Option<Value>, HandlerError> {
            Ok(Some(json!({ "ok": true })))
        }
    }

    #[tokio::test]
    async fn dequeue_execute_acknowledge_end_to_end() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new(30));

        let workflow_service = WorkflowService::new(Arc::clone(&store));
        let workflow = workflow_service.create_workflow("W", None, None).await.unwrap();
        workflow_service.add_step(workflow.id, "s0", "log", 0, None, None, None).await.unwrap();
        workflow_service.activate_workflow(workflow.id).await.unwrap();

        let executions = ExecutionService::new(Arc::clone(&store));
        let execution = executions.create_execution(workflow.id, "k1", None, None, None).await.unwrap();

        queue
            .enqueue(EnqueueRequest { execution_id: execution.id, payload: json!({}), ..Default::default() })
            .await
            .unwrap();

        let mut registry = TaskHandlerRegistry::new();
        registry.register(Arc::new(LoggingHandler));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::new(registry),
            RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(10)),
        ));

        let worker = Worker::new(Arc::clone(&queue), orchestrator, WorkerConfig {
            dequeue_blocking_timeout: Duration::from_millis(100),
            ..Default::default()
        });

        let message = queue.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        worker.handle_message(message).await;

        assert_eq!(queue.processing_length().await.unwrap(), 0);
        let final_execution = executions.get_execution(execution.id).await.unwrap();
        assert_eq!(final_execution.status, crate::state_machine::ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_execution_id_is_rejected_not_panicked() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new(30));
        let registry = TaskHandlerRegistry::new();
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), Arc::new(registry), RetryPolicy::default()));
        let worker = Worker::new(Arc::clone(&queue), orchestrator, WorkerConfig::default());

        queue
            .enqueue(EnqueueRequest { execution_id: Uuid::new_v4(), payload: json!({}), ..Default::default() })
            .await
            .unwrap();
        let message = queue.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        worker.handle_message(message).await;

        // rejected, not acknowledged -> requeued since attempt(1) < max_delivery_attempts(3)
        assert_eq!(queue.queue_length().await.unwrap(), 1);
        assert_eq!(queue.processing_length().await.unwrap(), 0);
    }
}
