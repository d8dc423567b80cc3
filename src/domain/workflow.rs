//! Workflow definitions and their steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a [`Workflow`] definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Deprecated,
    Archived,
}

/// A workflow definition: a named, versioned, ordered list of steps.
///
/// The step list itself is not embedded here — it is fetched separately
/// from the store, ordered by `step_order`, the way the store's own
/// `list_steps` operation returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub version: i32,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, description: Option<String>, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description,
            status: WorkflowStatus::Draft,
            version: 1,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A slot in a [`Workflow`] definition, keying into the handler registry
/// via `task_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub task_type: String,
    pub step_order: i32,
    pub config: Value,
    pub timeout_seconds: i32,
    pub max_retries: i32,
}

impl WorkflowStep {
    pub fn new(
        workflow_id: Uuid,
        name: impl Into<String>,
        task_type: impl Into<String>,
        step_order: i32,
        config: Value,
        timeout_seconds: i32,
        max_retries: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            name: name.into(),
            task_type: task_type.into(),
            step_order,
            config,
            timeout_seconds,
            max_retries,
        }
    }
}

/// True if `orders` forms a contiguous run starting at its own minimum,
/// e.g. `{0,1,2}` or `{5,6,7}`. Empty is not contiguous.
pub fn is_contiguous(orders: &[i32]) -> bool {
    if orders.is_empty() {
        return false;
    }
    let mut sorted = orders.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != orders.len() {
        return false;
    }
    let min = sorted[0];
    sorted
        .iter()
        .enumerate()
        .all(|(i, &order)| order == min + i as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_orders() {
        assert!(is_contiguous(&[0, 1, 2]));
        assert!(is_contiguous(&[5, 6, 7]));
        assert!(is_contiguous(&[2, 0, 1]));
    }

    #[test]
    fn non_contiguous_orders() {
        assert!(!is_contiguous(&[0, 2]));
        assert!(!is_contiguous(&[]));
        assert!(!is_contiguous(&[0, 0, 1]));
    }
}
