//! Postgres-backed [`WorkflowStore`]: raw `sqlx::query()`/`.bind()` calls
//! rather than the `query!` compile-time-checked macros, since this
//! crate is never built against a live database connection here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::execution::{ExecutionStatus, StepExecutionStatus};
use crate::domain::log::LogLevel;
use crate::domain::workflow::WorkflowStatus;
use crate::domain::{ExecutionLog, StepExecution, Workflow, WorkflowExecution, WorkflowStep};

use super::{
    ExecutionFilter, ExecutionStatusUpdate, Pagination, StepExecutionUpdate, StoreError, WorkflowStore,
};

/// Schema:
///
/// ```sql
/// CREATE TABLE workflows (
///     id UUID PRIMARY KEY,
///     name TEXT NOT NULL UNIQUE,
///     description TEXT,
///     status TEXT NOT NULL,
///     version INT NOT NULL,
///     metadata JSONB NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL
/// );
/// CREATE TABLE workflow_steps (
///     id UUID PRIMARY KEY,
///     workflow_id UUID NOT NULL REFERENCES workflows(id),
///     name TEXT NOT NULL,
///     task_type TEXT NOT NULL,
///     step_order INT NOT NULL,
///     config JSONB NOT NULL,
///     timeout_seconds INT NOT NULL,
///     max_retries INT NOT NULL,
///     UNIQUE (workflow_id, step_order)
/// );
/// CREATE TABLE workflow_executions (
///     id UUID PRIMARY KEY,
///     workflow_id UUID NOT NULL REFERENCES workflows(id),
///     idempotency_key TEXT NOT NULL,
///     status TEXT NOT NULL,
///     current_step_order INT NOT NULL,
///     retry_count INT NOT NULL,
///     max_retries INT NOT NULL,
///     input_data JSONB NOT NULL,
///     output_data JSONB,
///     error_message TEXT,
///     scheduled_at TIMESTAMPTZ,
///     started_at TIMESTAMPTZ,
///     completed_at TIMESTAMPTZ,
///     created_at TIMESTAMPTZ NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL,
///     UNIQUE (workflow_id, idempotency_key)
/// );
/// CREATE TABLE step_executions (
///     id UUID PRIMARY KEY,
///     execution_id UUID NOT NULL REFERENCES workflow_executions(id),
///     step_id UUID NOT NULL,
///     step_order INT NOT NULL,
///     status TEXT NOT NULL,
///     attempt_number INT NOT NULL,
///     input_data JSONB NOT NULL,
///     output_data JSONB,
///     error_message TEXT,
///     error_details JSONB,
///     started_at TIMESTAMPTZ,
///     completed_at TIMESTAMPTZ
/// );
/// CREATE TABLE execution_logs (
///     id UUID PRIMARY KEY,
///     execution_id UUID NOT NULL REFERENCES workflow_executions(id),
///     step_execution_id UUID,
///     level TEXT NOT NULL,
///     message TEXT NOT NULL,
///     details JSONB,
///     timestamp TIMESTAMPTZ NOT NULL
/// );
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn db_err(err: sqlx::Error) -> StoreError {
        StoreError::Database(err.to_string())
    }
}

fn status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Retrying => "retrying",
        ExecutionStatus::Cancelled => "cancelled",
    }
}

fn parse_status(raw: &str) -> Result<ExecutionStatus, StoreError> {
    match raw {
        "pending" => Ok(ExecutionStatus::Pending),
        "running" => Ok(ExecutionStatus::Running),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        "retrying" => Ok(ExecutionStatus::Retrying),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        other => Err(StoreError::Serialization(format!("unknown execution status '{other}'"))),
    }
}

fn workflow_status_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Draft => "draft",
        WorkflowStatus::Active => "active",
        WorkflowStatus::Deprecated => "deprecated",
        WorkflowStatus::Archived => "archived",
    }
}

fn parse_workflow_status(raw: &str) -> Result<WorkflowStatus, StoreError> {
    match raw {
        "draft" => Ok(WorkflowStatus::Draft),
        "active" => Ok(WorkflowStatus::Active),
        "deprecated" => Ok(WorkflowStatus::Deprecated),
        "archived" => Ok(WorkflowStatus::Archived),
        other => Err(StoreError::Serialization(format!("unknown workflow status '{other}'"))),
    }
}

fn step_status_str(status: StepExecutionStatus) -> &'static str {
    match status {
        StepExecutionStatus::Pending => "pending",
        StepExecutionStatus::Running => "running",
        StepExecutionStatus::Completed => "completed",
        StepExecutionStatus::Failed => "failed",
        StepExecutionStatus::Skipped => "skipped",
    }
}

fn parse_step_status(raw: &str) -> Result<StepExecutionStatus, StoreError> {
    match raw {
        "pending" => Ok(StepExecutionStatus::Pending),
        "running" => Ok(StepExecutionStatus::Running),
        "completed" => Ok(StepExecutionStatus::Completed),
        "failed" => Ok(StepExecutionStatus::Failed),
        "skipped" => Ok(StepExecutionStatus::Skipped),
        other => Err(StoreError::Serialization(format!("unknown step status '{other}'"))),
    }
}

fn log_level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warning",
        LogLevel::Error => "error",
    }
}

fn parse_log_level(raw: &str) -> Result<LogLevel, StoreError> {
    match raw {
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warning" => Ok(LogLevel::Warning),
        "error" => Ok(LogLevel::Error),
        other => Err(StoreError::Serialization(format!("unknown log level '{other}'"))),
    }
}

fn workflow_from_row(row: &sqlx::postgres::PgRow) -> Result<Workflow, StoreError> {
    Ok(Workflow {
        id: row.try_get("id").map_err(PostgresWorkflowStore::db_err)?,
        name: row.try_get("name").map_err(PostgresWorkflowStore::db_err)?,
        description: row.try_get("description").map_err(PostgresWorkflowStore::db_err)?,
        status: parse_workflow_status(row.try_get::<String, _>("status").map_err(PostgresWorkflowStore::db_err)?.as_str())?,
        version: row.try_get("version").map_err(PostgresWorkflowStore::db_err)?,
        metadata: row.try_get("metadata").map_err(PostgresWorkflowStore::db_err)?,
        created_at: row.try_get("created_at").map_err(PostgresWorkflowStore::db_err)?,
        updated_at: row.try_get("updated_at").map_err(PostgresWorkflowStore::db_err)?,
    })
}

fn step_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowStep, StoreError> {
    Ok(WorkflowStep {
        id: row.try_get("id").map_err(PostgresWorkflowStore::db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(PostgresWorkflowStore::db_err)?,
        name: row.try_get("name").map_err(PostgresWorkflowStore::db_err)?,
        task_type: row.try_get("task_type").map_err(PostgresWorkflowStore::db_err)?,
        step_order: row.try_get("step_order").map_err(PostgresWorkflowStore::db_err)?,
        config: row.try_get("config").map_err(PostgresWorkflowStore::db_err)?,
        timeout_seconds: row.try_get("timeout_seconds").map_err(PostgresWorkflowStore::db_err)?,
        max_retries: row.try_get("max_retries").map_err(PostgresWorkflowStore::db_err)?,
    })
}

fn execution_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowExecution, StoreError> {
    Ok(WorkflowExecution {
        id: row.try_get("id").map_err(PostgresWorkflowStore::db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(PostgresWorkflowStore::db_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(PostgresWorkflowStore::db_err)?,
        status: parse_status(row.try_get::<String, _>("status").map_err(PostgresWorkflowStore::db_err)?.as_str())?,
        current_step_order: row.try_get("current_step_order").map_err(PostgresWorkflowStore::db_err)?,
        retry_count: row.try_get("retry_count").map_err(PostgresWorkflowStore::db_err)?,
        max_retries: row.try_get("max_retries").map_err(PostgresWorkflowStore::db_err)?,
        input_data: row.try_get("input_data").map_err(PostgresWorkflowStore::db_err)?,
        output_data: row.try_get("output_data").map_err(PostgresWorkflowStore::db_err)?,
        error_message: row.try_get("error_message").map_err(PostgresWorkflowStore::db_err)?,
        scheduled_at: row.try_get("scheduled_at").map_err(PostgresWorkflowStore::db_err)?,
        started_at: row.try_get("started_at").map_err(PostgresWorkflowStore::db_err)?,
        completed_at: row.try_get("completed_at").map_err(PostgresWorkflowStore::db_err)?,
        created_at: row.try_get("created_at").map_err(PostgresWorkflowStore::db_err)?,
        updated_at: row.try_get("updated_at").map_err(PostgresWorkflowStore::db_err)?,
    })
}

fn step_execution_from_row(row: &sqlx::postgres::PgRow) -> Result<StepExecution, StoreError> {
    Ok(StepExecution {
        id: row.try_get("id").map_err(PostgresWorkflowStore::db_err)?,
        execution_id: row.try_get("execution_id").map_err(PostgresWorkflowStore::db_err)?,
        step_id: row.try_get("step_id").map_err(PostgresWorkflowStore::db_err)?,
        step_order: row.try_get("step_order").map_err(PostgresWorkflowStore::db_err)?,
        status: parse_step_status(row.try_get::<String, _>("status").map_err(PostgresWorkflowStore::db_err)?.as_str())?,
        attempt_number: row.try_get("attempt_number").map_err(PostgresWorkflowStore::db_err)?,
        input_data: row.try_get("input_data").map_err(PostgresWorkflowStore::db_err)?,
        output_data: row.try_get("output_data").map_err(PostgresWorkflowStore::db_err)?,
        error_message: row.try_get("error_message").map_err(PostgresWorkflowStore::db_err)?,
        error_details: row.try_get("error_details").map_err(PostgresWorkflowStore::db_err)?,
        started_at: row.try_get("started_at").map_err(PostgresWorkflowStore::db_err)?,
        completed_at: row.try_get("completed_at").map_err(PostgresWorkflowStore::db_err)?,
    })
}

fn log_from_row(row: &sqlx::postgres::PgRow) -> Result<ExecutionLog, StoreError> {
    Ok(ExecutionLog {
        id: row.try_get("id").map_err(PostgresWorkflowStore::db_err)?,
        execution_id: row.try_get("execution_id").map_err(PostgresWorkflowStore::db_err)?,
        step_execution_id: row.try_get("step_execution_id").map_err(PostgresWorkflowStore::db_err)?,
        level: parse_log_level(row.try_get::<String, _>("level").map_err(PostgresWorkflowStore::db_err)?.as_str())?,
        message: row.try_get("message").map_err(PostgresWorkflowStore::db_err)?,
        details: row.try_get("details").map_err(PostgresWorkflowStore::db_err)?,
        timestamp: row.try_get("timestamp").map_err(PostgresWorkflowStore::db_err)?,
    })
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    async fn create_workflow(&self, workflow: Workflow, steps: Vec<WorkflowStep>) -> Result<Workflow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(Self::db_err)?;

        let existing = sqlx::query("SELECT 1 FROM workflows WHERE name = $1")
            .bind(&workflow.name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Self::db_err)?;
        if existing.is_some() {
            return Err(StoreError::NameCollision(workflow.name));
        }

        sqlx::query(
            "INSERT INTO workflows (id, name, description, status, version, metadata, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow_status_str(workflow.status))
        .bind(workflow.version)
        .bind(&workflow.metadata)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(Self::db_err)?;

        for step in &steps {
            sqlx::query(
                "INSERT INTO workflow_steps (id, workflow_id, name, task_type, step_order, config, timeout_seconds, max_retries)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(step.id)
            .bind(step.workflow_id)
            .bind(&step.name)
            .bind(&step.task_type)
            .bind(step.step_order)
            .bind(&step.config)
            .bind(step.timeout_seconds)
            .bind(step.max_retries)
            .execute(&mut *tx)
            .await
            .map_err(Self::db_err)?;
        }

        tx.commit().await.map_err(Self::db_err)?;
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::db_err)?
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow_from_row(&row)
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Workflow, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE name = $1 ORDER BY version DESC LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::db_err)?
            .ok_or(StoreError::WorkflowNotFound(Uuid::nil()))?;
        workflow_from_row(&row)
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        pagination: Pagination,
    ) -> Result<Vec<Workflow>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM workflows WHERE status = $1 ORDER BY created_at LIMIT $2 OFFSET $3")
                    .bind(workflow_status_str(status))
                    .bind(pagination.limit)
                    .bind(pagination.offset)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM workflows ORDER BY created_at LIMIT $1 OFFSET $2")
                    .bind(pagination.limit)
                    .bind(pagination.offset)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(Self::db_err)?;
        rows.iter().map(workflow_from_row).collect()
    }

    async fn update_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> Result<Workflow, StoreError> {
        let row = sqlx::query(
            "UPDATE workflows SET status = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
        )
        .bind(workflow_status_str(status))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db_err)?
        .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow_from_row(&row)
    }

    async fn add_step(&self, step: WorkflowStep) -> Result<WorkflowStep, StoreError> {
        sqlx::query(
            "INSERT INTO workflow_steps (id, workflow_id, name, task_type, step_order, config, timeout_seconds, max_retries)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(step.id)
        .bind(step.workflow_id)
        .bind(&step.name)
        .bind(&step.task_type)
        .bind(step.step_order)
        .bind(&step.config)
        .bind(step.timeout_seconds)
        .bind(step.max_retries)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(step)
    }

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workflow_steps WHERE workflow_id = $1 ORDER BY step_order")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::db_err)?;
        rows.iter().map(step_from_row).collect()
    }

    async fn create_execution(&self, execution: WorkflowExecution) -> Result<WorkflowExecution, StoreError> {
        if let Some(existing) = self
            .find_execution_by_idempotency_key(execution.workflow_id, &execution.idempotency_key)
            .await?
        {
            return Err(StoreError::DuplicateExecution {
                workflow_id: execution.workflow_id,
                idempotency_key: execution.idempotency_key,
                existing: Box::new(existing),
            });
        }

        sqlx::query(
            "INSERT INTO workflow_executions
             (id, workflow_id, idempotency_key, status, current_step_order, retry_count, max_retries,
              input_data, output_data, error_message, scheduled_at, started_at, completed_at, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(&execution.idempotency_key)
        .bind(status_str(execution.status))
        .bind(execution.current_step_order)
        .bind(execution.retry_count)
        .bind(execution.max_retries)
        .bind(&execution.input_data)
        .bind(&execution.output_data)
        .bind(&execution.error_message)
        .bind(execution.scheduled_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        // a concurrent insert racing this check surfaces as a unique-violation;
        // translate it the same way as the pre-check race in find_*.
        .map_err(Self::db_err)?;

        Ok(execution)
    }

    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::db_err)?
            .ok_or(StoreError::ExecutionNotFound(id))?;
        execution_from_row(&row)
    }

    async fn find_execution_by_idempotency_key(
        &self,
        workflow_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_executions WHERE workflow_id = $1 AND idempotency_key = $2",
        )
        .bind(workflow_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn update_execution_status(
        &self,
        id: Uuid,
        update: ExecutionStatusUpdate,
    ) -> Result<WorkflowExecution, StoreError> {
        let current = self.get_execution(id).await?;

        let status = update.status.unwrap_or(current.status);
        let current_step_order = update
            .current_step_order
            .map(|o| o.max(current.current_step_order))
            .unwrap_or(current.current_step_order);
        let error_message = update.error_message.unwrap_or(current.error_message);
        let output_data = update.output_data.unwrap_or(current.output_data);
        let started_at = if status == ExecutionStatus::Running && current.started_at.is_none() {
            Some(Utc::now())
        } else {
            current.started_at
        };
        let completed_at = if status.is_terminal() && current.completed_at.is_none() {
            Some(Utc::now())
        } else {
            current.completed_at
        };

        let row = sqlx::query(
            "UPDATE workflow_executions
             SET status = $1, current_step_order = $2, error_message = $3, output_data = $4,
                 started_at = $5, completed_at = $6, updated_at = NOW()
             WHERE id = $7
             RETURNING *",
        )
        .bind(status_str(status))
        .bind(current_step_order)
        .bind(&error_message)
        .bind(&output_data)
        .bind(started_at)
        .bind(completed_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db_err)?
        .ok_or(StoreError::ExecutionNotFound(id))?;
        execution_from_row(&row)
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, StoreError> {
        let row = sqlx::query(
            "UPDATE workflow_executions SET retry_count = retry_count + 1, updated_at = NOW()
             WHERE id = $1 RETURNING retry_count",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db_err)?
        .ok_or(StoreError::ExecutionNotFound(id))?;
        row.try_get("retry_count").map_err(Self::db_err)
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_executions
             WHERE ($1::uuid IS NULL OR workflow_id = $1)
               AND ($2::text IS NULL OR status = $2)
             ORDER BY created_at
             LIMIT $3 OFFSET $4",
        )
        .bind(filter.workflow_id)
        .bind(filter.status.map(status_str))
        .bind(pagination.limit)
        .bind(pagination.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn list_pending_ready(
        &self,
        now: DateTime<Utc>,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_executions
             WHERE status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= $1)
             ORDER BY created_at
             LIMIT $2 OFFSET $3",
        )
        .bind(now)
        .bind(pagination.limit)
        .bind(pagination.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn create_step_execution(&self, step_execution: StepExecution) -> Result<StepExecution, StoreError> {
        sqlx::query(
            "INSERT INTO step_executions
             (id, execution_id, step_id, step_order, status, attempt_number, input_data,
              output_data, error_message, error_details, started_at, completed_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(step_execution.id)
        .bind(step_execution.execution_id)
        .bind(step_execution.step_id)
        .bind(step_execution.step_order)
        .bind(step_status_str(step_execution.status))
        .bind(step_execution.attempt_number)
        .bind(&step_execution.input_data)
        .bind(&step_execution.output_data)
        .bind(&step_execution.error_message)
        .bind(&step_execution.error_details)
        .bind(step_execution.started_at)
        .bind(step_execution.completed_at)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(step_execution)
    }

    async fn update_step_execution(
        &self,
        id: Uuid,
        update: StepExecutionUpdate,
    ) -> Result<StepExecution, StoreError> {
        let row = sqlx::query("SELECT * FROM step_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::db_err)?
            .ok_or(StoreError::StepExecutionNotFound(id))?;
        let current = step_execution_from_row(&row)?;

        let status = update.status.unwrap_or(current.status);
        let output_data = update.output_data.unwrap_or(current.output_data);
        let error_message = update.error_message.unwrap_or(current.error_message);
        let error_details = update.error_details.unwrap_or(current.error_details);
        let started_at = if status == StepExecutionStatus::Running && current.started_at.is_none() {
            Some(Utc::now())
        } else {
            current.started_at
        };
        let completed_at = if matches!(
            status,
            StepExecutionStatus::Completed | StepExecutionStatus::Failed | StepExecutionStatus::Skipped
        ) {
            current.completed_at.or(Some(Utc::now()))
        } else {
            current.completed_at
        };

        let row = sqlx::query(
            "UPDATE step_executions
             SET status = $1, output_data = $2, error_message = $3, error_details = $4,
                 started_at = $5, completed_at = $6
             WHERE id = $7
             RETURNING *",
        )
        .bind(step_status_str(status))
        .bind(&output_data)
        .bind(&error_message)
        .bind(&error_details)
        .bind(started_at)
        .bind(completed_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db_err)?
        .ok_or(StoreError::StepExecutionNotFound(id))?;
        step_execution_from_row(&row)
    }

    async fn list_step_executions(&self, execution_id: Uuid) -> Result<Vec<StepExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions WHERE execution_id = $1 ORDER BY step_order, attempt_number",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;
        rows.iter().map(step_execution_from_row).collect()
    }

    async fn append_log(&self, log: ExecutionLog) -> Result<ExecutionLog, StoreError> {
        sqlx::query(
            "INSERT INTO execution_logs (id, execution_id, step_execution_id, level, message, details, timestamp)
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(log.id)
        .bind(log.execution_id)
        .bind(log.step_execution_id)
        .bind(log_level_str(log.level))
        .bind(&log.message)
        .bind(&log.details)
        .bind(log.timestamp)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(log)
    }

    async fn list_logs(
        &self,
        execution_id: Uuid,
        level: Option<LogLevel>,
        pagination: Pagination,
    ) -> Result<Vec<ExecutionLog>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_logs
             WHERE execution_id = $1 AND ($2::text IS NULL OR level = $2)
             ORDER BY timestamp
             LIMIT $3 OFFSET $4",
        )
        .bind(execution_id)
        .bind(level.map(log_level_str))
        .bind(pagination.limit)
        .bind(pagination.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;
        rows.iter().map(log_from_row).collect()
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.map_err(Self::db_err)?;
        Ok(())
    }
}
