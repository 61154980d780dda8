//! PostgreSQL task store.
//!
//! Every transition is a single `UPDATE ... WHERE status = <expected>
//! RETURNING *`, so row-level locking gives the same conditional semantics as
//! the in-memory store across processes. Run-scoped writes also match
//! `run_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashSet;
use uuid::Uuid;

use super::{Finalize, Reschedule, StatusCounts, TaskStore};
use crate::error::{FableError, FableResult};
use crate::task::{RunId, Task, TaskFilter, TaskId, TaskPage, TaskPriority, TaskStatus, TaskType};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS fable_tasks (
        id UUID PRIMARY KEY,
        owner_id TEXT NOT NULL,
        task_type TEXT NOT NULL,
        priority SMALLINT NOT NULL,
        status TEXT NOT NULL,
        payload JSONB NOT NULL,
        progress SMALLINT NOT NULL DEFAULT 0,
        result JSONB,
        error TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        estimated_time BIGINT,
        actual_time BIGINT,
        created_at TIMESTAMPTZ NOT NULL,
        queued_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        run_id UUID
    )
    "#,
    "ALTER TABLE fable_tasks ADD COLUMN IF NOT EXISTS run_id UUID",
    "CREATE INDEX IF NOT EXISTS idx_fable_tasks_pickup \
     ON fable_tasks (status, priority DESC, queued_at, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_fable_tasks_owner ON fable_tasks (owner_id)",
    "CREATE INDEX IF NOT EXISTS idx_fable_tasks_completed ON fable_tasks (completed_at) \
     WHERE completed_at IS NOT NULL",
];

const PICKUP_ORDER: &str = "ORDER BY priority DESC, queued_at ASC, created_at ASC";

/// Task store backed by a PostgreSQL table
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Connect with a default pool
    pub async fn connect(database_url: &str) -> FableResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        tracing::info!("Connected to PostgreSQL task store");
        Ok(Self::from_pool(pool))
    }

    /// Use an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table and indexes if missing
    pub async fn migrate(&self) -> FableResult<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Task store schema ready");
        Ok(())
    }

    async fn fetch_one_task(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> FableResult<Option<Task>> {
        query
            .fetch_optional(&self.pool)
            .await?
            .map(|row| task_from_row(&row))
            .transpose()
    }
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> FableError {
    FableError::store_msg(format!("invalid value in column {column}: {detail}"))
}

fn to_u32(column: &str, value: i32) -> FableResult<u32> {
    u32::try_from(value).map_err(|e| corrupt(column, e))
}

fn to_u64(column: &str, value: Option<i64>) -> FableResult<Option<u64>> {
    value
        .map(|v| u64::try_from(v).map_err(|e| corrupt(column, e)))
        .transpose()
}

fn task_from_row(row: &PgRow) -> FableResult<Task> {
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let priority: i16 = row.try_get("priority")?;
    let progress: i16 = row.try_get("progress")?;

    Ok(Task {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        task_type: task_type.parse::<TaskType>()?,
        priority: TaskPriority::from_weight(priority)
            .ok_or_else(|| corrupt("priority", priority))?,
        status: status.parse::<TaskStatus>()?,
        payload: row.try_get("payload")?,
        progress: u8::try_from(progress).map_err(|e| corrupt("progress", e))?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        retry_count: to_u32("retry_count", row.try_get("retry_count")?)?,
        max_retries: to_u32("max_retries", row.try_get("max_retries")?)?,
        estimated_time: to_u64("estimated_time", row.try_get("estimated_time")?)?,
        actual_time: to_u64("actual_time", row.try_get("actual_time")?)?,
        created_at: row.try_get("created_at")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        run_id: row.try_get("run_id")?,
    })
}

fn as_i64(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert(&self, task: Task) -> FableResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fable_tasks (
                id, owner_id, task_type, priority, status, payload, progress, result, error,
                retry_count, max_retries, estimated_time, actual_time,
                created_at, queued_at, started_at, completed_at, run_id
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18
            )
            "#,
        )
        .bind(task.id)
        .bind(&task.owner_id)
        .bind(task.task_type.as_str())
        .bind(task.priority.weight())
        .bind(task.status.as_str())
        .bind(&task.payload)
        .bind(i16::from(task.progress))
        .bind(&task.result)
        .bind(&task.error)
        .bind(i32::try_from(task.retry_count).unwrap_or(i32::MAX))
        .bind(i32::try_from(task.max_retries).unwrap_or(i32::MAX))
        .bind(as_i64(task.estimated_time))
        .bind(as_i64(task.actual_time))
        .bind(task.created_at)
        .bind(task.queued_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.run_id)
        .execute(&self.pool)
        .await?;

        tracing::trace!(task_id = %task.id, "inserted task");
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> FableResult<Option<Task>> {
        self.fetch_one_task(sqlx::query("SELECT * FROM fable_tasks WHERE id = $1").bind(task_id))
            .await
    }

    async fn list_for_owner(&self, owner_id: &str, filter: &TaskFilter) -> FableResult<TaskPage> {
        let status = filter.status.map(|s| s.as_str());
        let task_type = filter.task_type.map(|t| t.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM fable_tasks
            WHERE owner_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR task_type = $3)
            "#,
        )
        .bind(owner_id)
        .bind(status)
        .bind(task_type)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT * FROM fable_tasks
            WHERE owner_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR task_type = $3)
            {PICKUP_ORDER}
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(owner_id)
        .bind(status)
        .bind(task_type)
        .bind(filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
        .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(TaskPage {
            tasks: rows.iter().map(task_from_row).collect::<FableResult<_>>()?,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        types: &[TaskType],
        limit: usize,
    ) -> FableResult<Vec<Task>> {
        let types: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT * FROM fable_tasks
            WHERE status = 'QUEUED' AND queued_at <= $1 AND task_type = ANY($2)
            {PICKUP_ORDER}
            LIMIT $3
            "#
        ))
        .bind(now)
        .bind(&types)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn claim(&self, task_id: TaskId, now: DateTime<Utc>) -> FableResult<Option<Task>> {
        self.fetch_one_task(
            sqlx::query(
                r#"
                UPDATE fable_tasks
                SET status = 'RUNNING', started_at = $2, completed_at = NULL, run_id = $3
                WHERE id = $1 AND status = 'QUEUED' AND queued_at <= $2
                RETURNING *
                "#,
            )
            .bind(task_id)
            .bind(now)
            .bind(Uuid::new_v4()),
        )
        .await
    }

    async fn update_progress(
        &self,
        task_id: TaskId,
        run_id: Option<RunId>,
        progress: u8,
    ) -> FableResult<Option<Task>> {
        self.fetch_one_task(
            sqlx::query(
                r#"
                UPDATE fable_tasks
                SET progress = GREATEST(progress, $2)
                WHERE id = $1 AND status = 'RUNNING' AND ($3::uuid IS NULL OR run_id = $3)
                RETURNING *
                "#,
            )
            .bind(task_id)
            .bind(i16::from(progress.min(100)))
            .bind(run_id),
        )
        .await
    }

    async fn finalize(&self, task_id: TaskId, outcome: Finalize) -> FableResult<Option<Task>> {
        self.fetch_one_task(
            sqlx::query(
                r#"
                UPDATE fable_tasks
                SET status = $2::text,
                    result = $3,
                    error = $4,
                    completed_at = $5,
                    actual_time = $6,
                    progress = CASE WHEN $2::text = 'COMPLETED' THEN 100 ELSE progress END,
                    run_id = NULL
                WHERE id = $1 AND status = 'RUNNING' AND run_id IS NOT DISTINCT FROM $7
                RETURNING *
                "#,
            )
            .bind(task_id)
            .bind(outcome.status.as_str())
            .bind(outcome.result)
            .bind(outcome.error)
            .bind(outcome.completed_at)
            .bind(as_i64(outcome.actual_time))
            .bind(outcome.run_id),
        )
        .await
    }

    async fn reschedule(&self, task_id: TaskId, retry: Reschedule) -> FableResult<Option<Task>> {
        self.fetch_one_task(
            sqlx::query(
                r#"
                UPDATE fable_tasks
                SET status = 'QUEUED',
                    retry_count = $2,
                    queued_at = $3,
                    error = $4,
                    started_at = NULL,
                    progress = 0,
                    run_id = NULL
                WHERE id = $1 AND status = 'RUNNING' AND run_id IS NOT DISTINCT FROM $5
                RETURNING *
                "#,
            )
            .bind(task_id)
            .bind(i32::try_from(retry.retry_count).unwrap_or(i32::MAX))
            .bind(retry.queued_at)
            .bind(retry.error)
            .bind(retry.run_id),
        )
        .await
    }

    async fn cancel(
        &self,
        task_id: TaskId,
        owner_id: Option<&str>,
        now: DateTime<Utc>,
        reason: &str,
    ) -> FableResult<Option<Task>> {
        self.fetch_one_task(
            sqlx::query(
                r#"
                UPDATE fable_tasks
                SET status = 'CANCELED', completed_at = $3, error = $4, run_id = NULL
                WHERE id = $1
                  AND status IN ('QUEUED', 'RUNNING')
                  AND ($2::text IS NULL OR owner_id = $2)
                RETURNING *
                "#,
            )
            .bind(task_id)
            .bind(owner_id)
            .bind(now)
            .bind(reason),
        )
        .await
    }

    async fn requeue_finished(
        &self,
        task_id: TaskId,
        owner_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> FableResult<Option<Task>> {
        self.fetch_one_task(
            sqlx::query(
                r#"
                UPDATE fable_tasks
                SET status = 'QUEUED',
                    retry_count = retry_count + 1,
                    error = NULL,
                    result = NULL,
                    progress = 0,
                    started_at = NULL,
                    completed_at = NULL,
                    actual_time = NULL,
                    queued_at = $3,
                    run_id = NULL
                WHERE id = $1
                  AND status IN ('FAILED', 'CANCELED')
                  AND retry_count < max_retries
                  AND ($2::text IS NULL OR owner_id = $2)
                RETURNING *
                "#,
            )
            .bind(task_id)
            .bind(owner_id)
            .bind(now),
        )
        .await
    }

    async fn count_ahead(&self, task: &Task) -> FableResult<u64> {
        let ahead: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM fable_tasks
            WHERE status = 'QUEUED'
              AND id <> $1
              AND (priority > $2 OR (priority = $2 AND queued_at < $3))
            "#,
        )
        .bind(task.id)
        .bind(task.priority.weight())
        .bind(task.queued_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(ahead).unwrap_or_default())
    }

    async fn status_counts(&self) -> FableResult<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM fable_tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.add(status.parse()?, u64::try_from(n).unwrap_or_default());
        }
        Ok(counts)
    }

    async fn finished_since(&self, since: DateTime<Utc>) -> FableResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM fable_tasks
            WHERE status IN ('COMPLETED', 'FAILED') AND completed_at >= $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn requeue_stale(
        &self,
        started_before: DateTime<Utc>,
        in_flight: &HashSet<TaskId>,
        now: DateTime<Utc>,
    ) -> FableResult<Vec<TaskId>> {
        let excluded: Vec<Uuid> = in_flight.iter().copied().collect();
        let recovered: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE fable_tasks
            SET status = 'QUEUED', started_at = NULL, progress = 0, queued_at = $3, run_id = NULL
            WHERE status = 'RUNNING'
              AND (started_at IS NULL OR started_at <= $1)
              AND id <> ALL($2)
            RETURNING id
            "#,
        )
        .bind(started_before)
        .bind(&excluded)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(recovered)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> FableResult<u64> {
        let purged = sqlx::query(
            r#"
            DELETE FROM fable_tasks
            WHERE status IN ('COMPLETED', 'FAILED', 'CANCELED') AND completed_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if purged > 0 {
            tracing::info!("Purged {} finished tasks", purged);
        }
        Ok(purged)
    }

    async fn health_check(&self) -> FableResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| FableError::store("PostgreSQL health check failed", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Runs only when `DATABASE_URL` points at a scratch database
    async fn store() -> Option<PostgresTaskStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PostgresTaskStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let Some(store) = store().await else { return };

        let mut task = Task::new("pg-u1", TaskType::Export, json!({ "n": 1 }), TaskPriority::High, 2);
        task.queued_at = Utc::now() - chrono::Duration::seconds(1);
        store.insert(task.clone()).await.unwrap();

        let (a, b) = tokio::join!(store.claim(task.id, Utc::now()), store.claim(task.id, Utc::now()));
        let winners: Vec<Task> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(winners.len(), 1);
        let run_id = winners[0].run_id;
        assert!(run_id.is_some());

        let progressed = store.update_progress(task.id, run_id, 40).await.unwrap().unwrap();
        assert_eq!(progressed.progress, 40);
        let lowered = store.update_progress(task.id, None, 10).await.unwrap().unwrap();
        assert_eq!(lowered.progress, 40);

        let done = store
            .finalize(
                task.id,
                Finalize {
                    run_id,
                    status: TaskStatus::Completed,
                    result: Some(json!({ "ok": true })),
                    error: None,
                    completed_at: Utc::now(),
                    actual_time: Some(3),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);

        assert_eq!(store.purge_finished(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
    }
}
