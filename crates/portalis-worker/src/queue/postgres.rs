//! Postgres-backed durable queue. Claims use `FOR UPDATE SKIP LOCKED` so
//! several workers can share one table.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    JobQueue, JobState, NewJob, QueueCounts, QueueError, QueuePolicy, QueuedJob, StallReport,
    STALLED_REASON,
};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS portalis_jobs (
        id            UUID PRIMARY KEY,
        name          TEXT NOT NULL,
        data          JSONB NOT NULL,
        priority      INTEGER NOT NULL DEFAULT 0,
        stable_id     TEXT,
        state         TEXT NOT NULL DEFAULT 'queued',
        attempts      INTEGER NOT NULL DEFAULT 0,
        stalled_count INTEGER NOT NULL DEFAULT 0,
        progress      SMALLINT NOT NULL DEFAULT 0,
        run_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        heartbeat_at  TIMESTAMPTZ,
        finished_at   TIMESTAMPTZ,
        outcome       JSONB,
        failed_reason TEXT,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS portalis_jobs_due
        ON portalis_jobs (state, priority DESC, run_at)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS portalis_jobs_pending_stable
        ON portalis_jobs (stable_id)
     WHERE state = 'queued' AND stable_id IS NOT NULL
    "#,
];

#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
    policy: QueuePolicy,
}

impl PgQueue {
    pub async fn connect(database_url: &str, policy: QueuePolicy) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self::from_pool(pool, policy))
    }

    pub fn from_pool(pool: PgPool, policy: QueuePolicy) -> Self {
        Self { pool, policy }
    }

    /// Idempotent; safe to run at every startup.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("job queue schema ready");
        Ok(())
    }

    async fn trim(&self, state: JobState, keep: usize) -> Result<(), QueueError> {
        let removed = sqlx::query(
            r#"
            DELETE FROM portalis_jobs
             WHERE state = $1
               AND id NOT IN (
                   SELECT id FROM portalis_jobs
                    WHERE state = $1
                    ORDER BY finished_at DESC NULLS LAST
                    LIMIT $2
               )
            "#,
        )
        .bind(state.as_str())
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if removed > 0 {
            debug!(state = state.as_str(), removed, "trimmed job history");
        }
        Ok(())
    }

    /// Why an update guarded by `state = 'active'` touched no row.
    async fn not_active(&self, id: Uuid) -> QueueError {
        match sqlx::query("SELECT state FROM portalis_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => inactive_error(id, row.is_some()),
            Err(err) => err.into(),
        }
    }
}

fn inactive_error(id: Uuid, exists: bool) -> QueueError {
    if exists {
        QueueError::LostJob(id)
    } else {
        QueueError::UnknownJob(id)
    }
}

fn interval_secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

fn queued_job(row: &PgRow) -> Result<QueuedJob, QueueError> {
    let count = |column: &str| -> Result<u32, QueueError> {
        let raw: i32 = row.try_get(column)?;
        Ok(u32::try_from(raw).unwrap_or_default())
    };
    Ok(QueuedJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        data: row.try_get("data")?,
        priority: row.try_get("priority")?,
        attempts: count("attempts")?,
        stalled_count: count("stalled_count")?,
        stable_id: row.try_get("stable_id")?,
    })
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;
        if let Some(stable_id) = &job.stable_id {
            sqlx::query("DELETE FROM portalis_jobs WHERE stable_id = $1 AND state = 'queued'")
                .bind(stable_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            r#"
            INSERT INTO portalis_jobs (id, name, data, priority, stable_id, run_at)
            VALUES ($1, $2, $3, $4, $5, NOW() + make_interval(secs => $6))
            "#,
        )
        .bind(id)
        .bind(&job.name)
        .bind(&job.data)
        .bind(job.priority)
        .bind(&job.stable_id)
        .bind(interval_secs(job.delay))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE portalis_jobs
               SET state = 'active',
                   attempts = attempts + 1,
                   progress = 0,
                   heartbeat_at = NOW()
             WHERE id = (
                   SELECT id FROM portalis_jobs
                    WHERE state = 'queued' AND run_at <= NOW()
                    ORDER BY priority DESC, run_at, created_at
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
             )
            RETURNING id, name, data, priority, attempts, stalled_count, stable_id
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(queued_job).transpose()
    }

    async fn heartbeat(&self, id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query("UPDATE portalis_jobs SET heartbeat_at = NOW() WHERE id = $1 AND state = 'active'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(self.not_active(id).await);
        }
        Ok(())
    }

    async fn progress(&self, id: Uuid, percent: u8) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE portalis_jobs SET progress = $2, heartbeat_at = NOW() WHERE id = $1 AND state = 'active'",
        )
        .bind(id)
        .bind(i16::from(percent.min(100)))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.not_active(id).await);
        }
        Ok(())
    }

    async fn complete(&self, id: Uuid, outcome: Value) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE portalis_jobs
               SET state = 'completed', progress = 100, outcome = $2, finished_at = NOW()
             WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(id)
        .bind(&outcome)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.not_active(id).await);
        }
        self.trim(JobState::Completed, self.policy.keep_completed).await
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<JobState, QueueError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT attempts, state FROM portalis_jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(QueueError::UnknownJob(id))?;
        let state: String = row.try_get("state")?;
        if JobState::parse(&state) != Some(JobState::Active) {
            return Err(QueueError::LostJob(id));
        }
        let attempts: i32 = row.try_get("attempts")?;
        let attempts = u32::try_from(attempts).unwrap_or_default();

        let next = if attempts < self.policy.max_attempts {
            sqlx::query(
                r#"
                UPDATE portalis_jobs
                   SET state = 'queued', failed_reason = $2,
                       run_at = NOW() + make_interval(secs => $3)
                 WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(reason)
            .bind(interval_secs(self.policy.retry_delay(attempts)))
            .execute(&mut *tx)
            .await?;
            JobState::Queued
        } else {
            sqlx::query(
                r#"
                UPDATE portalis_jobs
                   SET state = 'failed', failed_reason = $2, finished_at = NOW()
                 WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(reason)
            .execute(&mut *tx)
            .await?;
            JobState::Failed
        };
        tx.commit().await?;

        if next == JobState::Failed {
            self.trim(JobState::Failed, self.policy.keep_failed).await?;
        }
        Ok(next)
    }

    async fn reap_stalled(&self, stall_timeout: Duration) -> Result<StallReport, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE portalis_jobs
               SET stalled_count = stalled_count + 1,
                   state = CASE WHEN stalled_count + 1 > $2 THEN 'failed' ELSE 'queued' END,
                   failed_reason = CASE WHEN stalled_count + 1 > $2 THEN $3 ELSE failed_reason END,
                   finished_at = CASE WHEN stalled_count + 1 > $2 THEN NOW() ELSE NULL END,
                   run_at = NOW()
             WHERE state = 'active'
               AND (heartbeat_at IS NULL OR heartbeat_at <= NOW() - make_interval(secs => $1))
            RETURNING state
            "#,
        )
        .bind(interval_secs(stall_timeout))
        .bind(i32::try_from(self.policy.max_stalled_count).unwrap_or(i32::MAX))
        .bind(STALLED_REASON)
        .fetch_all(&self.pool)
        .await?;

        let mut report = StallReport::default();
        for row in &rows {
            let state: String = row.try_get("state")?;
            match JobState::parse(&state) {
                Some(JobState::Failed) => report.failed += 1,
                _ => report.requeued += 1,
            }
        }
        if report.failed > 0 {
            self.trim(JobState::Failed, self.policy.keep_failed).await?;
        }
        Ok(report)
    }

    async fn clear_recurring(&self) -> Result<usize, QueueError> {
        let removed = sqlx::query(
            "DELETE FROM portalis_jobs WHERE state = 'queued' AND stable_id IS NOT NULL",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM portalis_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = QueueCounts::new();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            if let Some(state) = JobState::parse(&state) {
                counts.insert(state, usize::try_from(n).unwrap_or_default());
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_updates_distinguish_lost_from_unknown_jobs() {
        let id = Uuid::new_v4();
        assert!(matches!(inactive_error(id, true), QueueError::LostJob(lost) if lost == id));
        assert!(matches!(inactive_error(id, false), QueueError::UnknownJob(_)));
    }
}
