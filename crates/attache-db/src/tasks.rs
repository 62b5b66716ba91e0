//! Deferred task queue backed by PostgreSQL.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use uuid::Uuid;

use attache_core::defaults::JOB_MAX_ATTEMPTS;
use attache_core::{new_v7, Error, PurgeTask, QueuedTask, Result, TaskKind, TaskQueue, TaskStatus};

/// PostgreSQL implementation of TaskQueue.
pub struct PgTaskQueue {
    pool: Pool<Postgres>,
    max_attempts: i32,
    notify: Arc<Notify>,
}

impl PgTaskQueue {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            max_attempts: JOB_MAX_ATTEMPTS,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Override the attempt limit stamped on newly enqueued tasks.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Handle notified whenever a task is enqueued.
    pub fn task_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn parse_task_row(row: sqlx::postgres::PgRow) -> Result<QueuedTask> {
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        let payload: serde_json::Value = row.get("payload");
        Ok(QueuedTask {
            id: row.get("id"),
            kind: kind.parse().map_err(Error::Job)?,
            payload: serde_json::from_value(payload)?,
            status: status.parse().map_err(Error::Job)?,
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            last_error: row.get("last_error"),
            enqueued_at: row.get("enqueued_at"),
            started_at: row.get("started_at"),
        })
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: PurgeTask) -> Result<Uuid> {
        let task_id = new_v7();
        let payload = serde_json::to_value(&task)?;

        sqlx::query(
            "INSERT INTO attache_tasks (id, kind, payload, status, attempts, max_attempts, enqueued_at)
             VALUES ($1, $2, $3, $4, 0, $5, $6)",
        )
        .bind(task_id)
        .bind(TaskKind::PurgeBlob.as_str())
        .bind(&payload)
        .bind(TaskStatus::Pending.as_str())
        .bind(self.max_attempts)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.notify.notify_waiters();
        Ok(task_id)
    }

    async fn claim_next(&self) -> Result<Option<QueuedTask>> {
        // SKIP LOCKED lets several workers poll the same table.
        let row = sqlx::query(
            "UPDATE attache_tasks
             SET status = 'running', attempts = attempts + 1, started_at = $1
             WHERE id = (
                 SELECT id FROM attache_tasks
                 WHERE status = 'pending'
                 ORDER BY enqueued_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, kind, payload, status, attempts, max_attempts, last_error, enqueued_at, started_at",
        )
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_task_row).transpose()
    }

    async fn complete(&self, task_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE attache_tasks
             SET status = 'completed', completed_at = $1
             WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::Job(format!("task {} not found", task_id)));
        }
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let (attempts, max_attempts): (i32, i32) = sqlx::query_as(
            "SELECT attempts, max_attempts FROM attache_tasks WHERE id = $1 FOR UPDATE",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::Job(format!("task {} not found", task_id)))?;

        if attempts < max_attempts {
            sqlx::query(
                "UPDATE attache_tasks
                 SET status = 'pending', last_error = $1, started_at = NULL
                 WHERE id = $2",
            )
            .bind(error)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        } else {
            sqlx::query(
                "UPDATE attache_tasks
                 SET status = 'failed', last_error = $1, completed_at = $2
                 WHERE id = $3",
            )
            .bind(error)
            .bind(Utc::now())
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM attache_tasks WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count)
    }

    async fn requeue_stale(&self, older_than: std::time::Duration) -> Result<u64> {
        let now = Utc::now();
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Job(format!("stale threshold out of range: {}", e)))?;
        let result = sqlx::query(
            "UPDATE attache_tasks
             SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                 last_error = 'worker lost while running',
                 started_at = NULL,
                 completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE $2 END
             WHERE status = 'running' AND (started_at IS NULL OR started_at <= $1)",
        )
        .bind(now - older_than)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(requeued)
    }
}
