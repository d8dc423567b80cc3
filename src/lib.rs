//! Durable workflow orchestration core.
//!
//! ```text
//!            +-----------------+        +----------------+
//!  caller -->|  WorkflowService |        |ExecutionService|
//!            +-----------------+        +----------------+
//!                     \                        /
//!                      v                      v
//!                    +--------------------------+
//!                    |       WorkflowStore      |
//!                    +--------------------------+
//!                               ^
//!                               |
//!                    +--------------------------+
//!                    |        Orchestrator       |<---+
//!                    +--------------------------+     |
//!                               ^                      |
//!                               | execution_id         | per-step retry
//!                    +--------------------------+      | (exponential backoff)
//!                    |          Worker          |------+
//!                    +--------------------------+
//!                               ^
//!                               | dequeue/ack/reject
//!                    +--------------------------+
//!                    |         TaskQueue         |
//!                    +--------------------------+
//! ```
//!
//! The store and queue are trait objects so a deployment can run entirely
//! in memory (tests, small installs) or against Postgres (everything
//! else) without the rest of the crate noticing.

pub mod config;
pub mod domain;
pub mod error;
pub mod execution_service;
pub mod handler;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod worker;
pub mod workflow_service;

/// Re-exports of the types most callers need.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::{
        ExecutionLog, LogLevel, StepExecution, StepExecutionStatus, Workflow, WorkflowExecution, WorkflowStatus,
        WorkflowStep,
    };
    pub use crate::error::CoreError;
    pub use crate::execution_service::ExecutionService;
    pub use crate::handler::{HandlerError, TaskHandler, TaskHandlerRegistry};
    pub use crate::orchestrator::{Orchestrator, OrchestratorOutcome};
    pub use crate::queue::{EnqueueRequest, Message, TaskQueue};
    pub use crate::retry::RetryPolicy;
    pub use crate::state_machine::ExecutionStatus;
    pub use crate::store::WorkflowStore;
    pub use crate::worker::{Worker, WorkerConfig};
    pub use crate::workflow_service::WorkflowService;
}
