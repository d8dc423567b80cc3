//! Durable task queue: at-least-once delivery with visibility timeouts,
//! delayed delivery, a dead-letter sink, and enqueue idempotency.
//!
//! Implemented as a Postgres claim queue using `SELECT ... FOR UPDATE
//! SKIP LOCKED`, which expresses every operation this module needs —
//! visibility timeout becomes a `claimed_at`/heartbeat staleness check,
//! the delayed set becomes a `ready_at` column, the DLQ and idempotency
//! set become tables.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(String),

    #[error("message not found: {0}")]
    MessageNotFound(Uuid),
}

/// One unit of dispatchable work: a pointer to an execution, not its state.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub task_type: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub attempt: i32,
    pub visibility_timeout_secs: i64,
}

/// Input to `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub execution_id: Uuid,
    pub task_type: Option<String>,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub delay_seconds: Option<i64>,
}

/// Why a message left `processing` via `reject`.
#[derive(Debug, Clone)]
pub enum RejectOutcome {
    Requeued { attempt: i32 },
    MovedToDlq { reason: String },
}

#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub message: Message,
    pub reason: String,
    pub dlq_timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Enqueues a message. Returns `None` if `idempotency_key` was seen
    /// within the last 24h (dedup window) — nothing is enqueued in that
    /// case.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Option<Message>, QueueError>;

    /// Promotes any due delayed messages, then claims up to one ready
    /// message, moving it into the in-flight set with a visibility
    /// timeout. `None` if nothing was ready within `blocking_timeout`.
    async fn dequeue(&self, blocking_timeout: std::time::Duration) -> Result<Option<Message>, QueueError>;

    /// Removes a message from the in-flight set permanently.
    async fn acknowledge(&self, message_id: Uuid) -> Result<(), QueueError>;

    /// Removes a message from the in-flight set and either requeues it
    /// with an incremented attempt count or routes it to the DLQ.
    async fn reject(&self, message_id: Uuid, to_dlq: bool, reason: Option<String>) -> Result<RejectOutcome, QueueError>;

    /// Scans the in-flight set for messages whose visibility window has
    /// expired, requeuing (attempt <= 3) or DLQ-routing them. Returns the
    /// number of messages recovered.
    async fn recover_stale(&self, max_attempts_before_dlq: i32) -> Result<usize, QueueError>;

    async fn queue_length(&self) -> Result<usize, QueueError>;

    async fn processing_length(&self) -> Result<usize, QueueError>;

    async fn dlq_length(&self) -> Result<usize, QueueError>;

    async fn list_dlq(&self, limit: i64, offset: i64) -> Result<Vec<DlqEntry>, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

pub use memory::InMemoryTaskQueue;
pub use postgres::PostgresTaskQueue;
