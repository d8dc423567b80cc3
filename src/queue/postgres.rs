//! Postgres-backed [`TaskQueue`]: `SELECT ... FOR UPDATE SKIP LOCKED`
//! inside a CTE, feeding an `UPDATE ... RETURNING` so concurrent workers
//! never observe the same row.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{DlqEntry, EnqueueRequest, Message, QueueError, RejectOutcome, TaskQueue};

/// Schema:
///
/// ```sql
/// CREATE TABLE task_queue (
///     id UUID PRIMARY KEY,
///     execution_id UUID NOT NULL,
///     task_type TEXT,
///     payload JSONB NOT NULL,
///     status TEXT NOT NULL, -- 'ready' | 'claimed'
///     attempt INT NOT NULL,
///     visibility_timeout_secs BIGINT NOT NULL,
///     ready_at TIMESTAMPTZ NOT NULL,
///     claimed_at TIMESTAMPTZ,
///     created_at TIMESTAMPTZ NOT NULL
/// );
/// CREATE TABLE task_dlq (
///     id UUID PRIMARY KEY,
///     execution_id UUID NOT NULL,
///     task_type TEXT,
///     payload JSONB NOT NULL,
///     attempt INT NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     reason TEXT NOT NULL,
///     dlq_timestamp TIMESTAMPTZ NOT NULL
/// );
/// CREATE TABLE task_idempotency (
///     key TEXT PRIMARY KEY,
///     expires_at TIMESTAMPTZ NOT NULL
/// );
/// ```
#[derive(Clone)]
pub struct PostgresTaskQueue {
    pool: PgPool,
    default_visibility_timeout_secs: i64,
}

impl PostgresTaskQueue {
    pub fn new(pool: PgPool, default_visibility_timeout_secs: i64) -> Self {
        Self {
            pool,
            default_visibility_timeout_secs,
        }
    }

    fn db_err(err: sqlx::Error) -> QueueError {
        QueueError::Database(err.to_string())
    }
}

fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<Message, QueueError> {
    Ok(Message {
        id: row.try_get("id").map_err(PostgresTaskQueue::db_err)?,
        execution_id: row.try_get("execution_id").map_err(PostgresTaskQueue::db_err)?,
        task_type: row.try_get("task_type").map_err(PostgresTaskQueue::db_err)?,
        payload: row.try_get("payload").map_err(PostgresTaskQueue::db_err)?,
        created_at: row.try_get("created_at").map_err(PostgresTaskQueue::db_err)?,
        attempt: row.try_get("attempt").map_err(PostgresTaskQueue::db_err)?,
        visibility_timeout_secs: row.try_get("visibility_timeout_secs").map_err(PostgresTaskQueue::db_err)?,
    })
}

#[async_trait]
impl TaskQueue for PostgresTaskQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Option<Message>, QueueError> {
        let now = Utc::now();

        if let Some(key) = &request.idempotency_key {
            let mut tx = self.pool.begin().await.map_err(Self::db_err)?;
            let existing = sqlx::query("SELECT expires_at FROM task_idempotency WHERE key = $1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Self::db_err)?;
            if let Some(row) = existing {
                let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(Self::db_err)?;
                if expires_at > now {
                    return Ok(None);
                }
            }
            sqlx::query(
                "INSERT INTO task_idempotency (key, expires_at) VALUES ($1, $2)
                 ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at",
            )
            .bind(key)
            .bind(now + chrono::Duration::hours(24))
            .execute(&mut *tx)
            .await
            .map_err(Self::db_err)?;
            tx.commit().await.map_err(Self::db_err)?;
        }

        let ready_at = now + chrono::Duration::seconds(request.delay_seconds.unwrap_or(0).max(0));
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO task_queue
             (id, execution_id, task_type, payload, status, attempt, visibility_timeout_secs, ready_at, claimed_at, created_at)
             VALUES ($1,$2,$3,$4,'ready',1,$5,$6,NULL,$7)",
        )
        .bind(id)
        .bind(request.execution_id)
        .bind(&request.task_type)
        .bind(&request.payload)
        .bind(self.default_visibility_timeout_secs)
        .bind(ready_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(Some(Message {
            id,
            execution_id: request.execution_id,
            task_type: request.task_type,
            payload: request.payload,
            created_at: now,
            attempt: 1,
            visibility_timeout_secs: self.default_visibility_timeout_secs,
        }))
    }

    async fn dequeue(&self, blocking_timeout: StdDuration) -> Result<Option<Message>, QueueError> {
        let deadline = std::time::Instant::now() + blocking_timeout;
        loop {
            let row = sqlx::query(
                "WITH claimable AS (
                     SELECT id FROM task_queue
                     WHERE status = 'ready' AND ready_at <= NOW()
                     ORDER BY ready_at
                     LIMIT 1
                     FOR UPDATE SKIP LOCKED
                 )
                 UPDATE task_queue t
                 SET status = 'claimed', claimed_at = NOW()
                 FROM claimable c
                 WHERE t.id = c.id
                 RETURNING t.*",
            )
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::db_err)?;

            if let Some(row) = row {
                return Ok(Some(message_from_row(&row)?));
            }
            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
    }

    async fn acknowledge(&self, message_id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM task_queue WHERE id = $1 AND status = 'claimed'")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(Self::db_err)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::MessageNotFound(message_id));
        }
        Ok(())
    }

    async fn reject(
        &self,
        message_id: Uuid,
        to_dlq: bool,
        reason: Option<String>,
    ) -> Result<RejectOutcome, QueueError> {
        let mut tx = self.pool.begin().await.map_err(Self::db_err)?;
        let row = sqlx::query("SELECT * FROM task_queue WHERE id = $1 AND status = 'claimed' FOR UPDATE")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Self::db_err)?
            .ok_or(QueueError::MessageNotFound(message_id))?;
        let message = message_from_row(&row)?;

        sqlx::query("DELETE FROM task_queue WHERE id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .map_err(Self::db_err)?;

        let outcome = if to_dlq {
            let reason = reason.unwrap_or_else(|| "rejected".to_string());
            sqlx::query(
                "INSERT INTO task_dlq (id, execution_id, task_type, payload, attempt, created_at, reason, dlq_timestamp)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
            )
            .bind(message.id)
            .bind(message.execution_id)
            .bind(&message.task_type)
            .bind(&message.payload)
            .bind(message.attempt)
            .bind(message.created_at)
            .bind(&reason)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(Self::db_err)?;
            RejectOutcome::MovedToDlq { reason }
        } else {
            let attempt = message.attempt + 1;
            sqlx::query(
                "INSERT INTO task_queue
                 (id, execution_id, task_type, payload, status, attempt, visibility_timeout_secs, ready_at, claimed_at, created_at)
                 VALUES ($1,$2,$3,$4,'ready',$5,$6,NOW(),NULL,$7)",
            )
            .bind(message.id)
            .bind(message.execution_id)
            .bind(&message.task_type)
            .bind(&message.payload)
            .bind(attempt)
            .bind(message.visibility_timeout_secs)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await
            .map_err(Self::db_err)?;
            RejectOutcome::Requeued { attempt }
        };

        tx.commit().await.map_err(Self::db_err)?;
        Ok(outcome)
    }

    async fn recover_stale(&self, max_attempts_before_dlq: i32) -> Result<usize, QueueError> {
        let mut tx = self.pool.begin().await.map_err(Self::db_err)?;
        let stale_rows = sqlx::query(
            "SELECT * FROM task_queue
             WHERE status = 'claimed'
               AND claimed_at + (visibility_timeout_secs * INTERVAL '1 second') <= NOW()
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(Self::db_err)?;

        let mut recovered = 0;
        for row in stale_rows {
            let message = message_from_row(&row)?;
            sqlx::query("DELETE FROM task_queue WHERE id = $1")
                .bind(message.id)
                .execute(&mut *tx)
                .await
                .map_err(Self::db_err)?;

            if message.attempt >= max_attempts_before_dlq {
                sqlx::query(
                    "INSERT INTO task_dlq (id, execution_id, task_type, payload, attempt, created_at, reason, dlq_timestamp)
                     VALUES ($1,$2,$3,$4,$5,$6,'max_attempts_exceeded',$7)",
                )
                .bind(message.id)
                .bind(message.execution_id)
                .bind(&message.task_type)
                .bind(&message.payload)
                .bind(message.attempt)
                .bind(message.created_at)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(Self::db_err)?;
            } else {
                sqlx::query(
                    "INSERT INTO task_queue
                     (id, execution_id, task_type, payload, status, attempt, visibility_timeout_secs, ready_at, claimed_at, created_at)
                     VALUES ($1,$2,$3,$4,'ready',$5,$6,NOW(),NULL,$7)",
                )
                .bind(message.id)
                .bind(message.execution_id)
                .bind(&message.task_type)
                .bind(&message.payload)
                .bind(message.attempt + 1)
                .bind(message.visibility_timeout_secs)
                .bind(message.created_at)
                .execute(&mut *tx)
                .await
                .map_err(Self::db_err)?;
            }
            recovered += 1;
        }

        tx.commit().await.map_err(Self::db_err)?;
        Ok(recovered)
    }

    async fn queue_length(&self) -> Result<usize, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM task_queue WHERE status = 'ready'")
            .fetch_one(&self.pool)
            .await
            .map_err(Self::db_err)?;
        let n: i64 = row.try_get("n").map_err(Self::db_err)?;
        Ok(n as usize)
    }

    async fn processing_length(&self) -> Result<usize, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM task_queue WHERE status = 'claimed'")
            .fetch_one(&self.pool)
            .await
            .map_err(Self::db_err)?;
        let n: i64 = row.try_get("n").map_err(Self::db_err)?;
        Ok(n as usize)
    }

    async fn dlq_length(&self) -> Result<usize, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM task_dlq")
            .fetch_one(&self.pool)
            .await
            .map_err(Self::db_err)?;
        let n: i64 = row.try_get("n").map_err(Self::db_err)?;
        Ok(n as usize)
    }

    async fn list_dlq(&self, limit: i64, offset: i64) -> Result<Vec<DlqEntry>, QueueError> {
        let rows = sqlx::query(
            "SELECT * FROM task_dlq ORDER BY dlq_timestamp LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;

        rows.iter()
            .map(|row| {
                Ok(DlqEntry {
                    message: Message {
                        id: row.try_get("id").map_err(Self::db_err)?,
                        execution_id: row.try_get("execution_id").map_err(Self::db_err)?,
                        task_type: row.try_get("task_type").map_err(Self::db_err)?,
                        payload: row.try_get("payload").map_err(Self::db_err)?,
                        created_at: row.try_get("created_at").map_err(Self::db_err)?,
                        attempt: row.try_get("attempt").map_err(Self::db_err)?,
                        visibility_timeout_secs: 0,
                    },
                    reason: row.try_get("reason").map_err(Self::db_err)?,
                    dlq_timestamp: row.try_get("dlq_timestamp").map_err(Self::db_err)?,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.map_err(Self::db_err)?;
        Ok(())
    }
}
