//! Durable job queue contract and its two backends.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use portalis_core::JobSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PgQueue;

pub const KEEP_COMPLETED: usize = 10;
pub const KEEP_FAILED: usize = 20;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection failed: {0}")]
    Connection(String),
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("unknown job {0}")]
    UnknownJob(Uuid),
    /// The job is no longer active, e.g. it was requeued as stalled.
    #[error("job {0} is no longer held by this runner")]
    LostJob(Uuid),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err.to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [Self::Queued, Self::Active, Self::Completed, Self::Failed]
            .into_iter()
            .find(|s| s.as_str() == raw)
    }
}

/// Retry and retention rules shared by both backends.
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_stalled_count: u32,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_backoff: Duration::from_secs(5),
            max_stalled_count: 1,
            keep_completed: KEEP_COMPLETED,
            keep_failed: KEEP_FAILED,
        }
    }
}

impl QueuePolicy {
    /// Exponential delay before attempt `attempts + 1`.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << exp)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub data: Value,
    pub delay: Duration,
    /// Higher runs first among due jobs.
    pub priority: i32,
    /// A pending job with the same id is replaced rather than duplicated.
    pub stable_id: Option<String>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            delay: Duration::ZERO,
            priority: 0,
            stable_id: None,
        }
    }

    pub fn for_spec(spec: &JobSpec) -> Self {
        Self::new(spec.kind().queue_name(), spec.payload())
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn stable_id(mut self, id: impl Into<String>) -> Self {
        self.stable_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: Uuid,
    pub name: String,
    pub data: Value,
    pub priority: i32,
    /// Includes the current attempt.
    pub attempts: u32,
    pub stalled_count: u32,
    pub stable_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallReport {
    pub requeued: usize,
    pub failed: usize,
}

pub type QueueCounts = BTreeMap<JobState, usize>;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError>;

    /// Claims the highest-priority due job and marks it active.
    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError>;

    /// Heartbeat, progress, complete and fail only apply to an active job;
    /// otherwise they return [`QueueError::LostJob`].
    async fn heartbeat(&self, id: Uuid) -> Result<(), QueueError>;

    /// Stores progress (0..=100); also counts as a heartbeat.
    async fn progress(&self, id: Uuid, percent: u8) -> Result<(), QueueError>;

    async fn complete(&self, id: Uuid, outcome: Value) -> Result<(), QueueError>;

    /// Requeues with back-off while attempts remain, otherwise marks failed.
    /// Returns the resulting state.
    async fn fail(&self, id: Uuid, reason: &str) -> Result<JobState, QueueError>;

    /// Requeues active jobs without a heartbeat inside `stall_timeout`;
    /// jobs stalled more than the policy allows are failed.
    async fn reap_stalled(&self, stall_timeout: Duration) -> Result<StallReport, QueueError>;

    /// Drops pending jobs that were enqueued by a recurring definition.
    async fn clear_recurring(&self) -> Result<usize, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

pub(crate) const STALLED_REASON: &str = "job stalled more than allowable limit";

#[cfg(test)]
mod tests {
    use super::*;
    use portalis_core::IndicatorJobData;

    #[test]
    fn retry_delay_doubles() {
        let policy = QueuePolicy::default();
        assert_eq!(policy.retry_delay(1), Duration::from_secs(5));
        assert_eq!(policy.retry_delay(2), Duration::from_secs(10));
        assert_eq!(policy.retry_delay(3), Duration::from_secs(20));
    }

    #[test]
    fn jobs_built_from_specs_carry_queue_name_and_payload() {
        let spec = JobSpec::Indicators(IndicatorJobData::economic(&["DE".to_string()]));
        let job = NewJob::for_spec(&spec)
            .priority(1)
            .delay(Duration::from_secs(10));
        assert_eq!(job.name, "worldbank.indicators");
        assert_eq!(job.data["countries"][0], "DE");
        assert_eq!(job.priority, 1);
        assert!(job.stable_id.is_none());
    }

    #[test]
    fn states_round_trip_through_text() {
        for state in [JobState::Queued, JobState::Active, JobState::Completed, JobState::Failed] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("stalled"), None);
    }
}
