//! Append-only execution audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One audit record attached to an execution, optionally scoped to a
/// single step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_execution_id: Option<Uuid>,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn new(
        execution_id: Uuid,
        step_execution_id: Option<Uuid>,
        level: LogLevel,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_execution_id,
            level,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}
