//! Durable entities: workflows, steps, executions, step executions, logs.

pub mod execution;
pub mod log;
pub mod workflow;

pub use execution::{StepExecution, StepExecutionStatus, WorkflowExecution};
pub use log::{ExecutionLog, LogLevel};
pub use workflow::{Workflow, WorkflowStatus, WorkflowStep};
