//! In-process queue used when no queue database is configured, and in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    JobQueue, JobState, NewJob, QueueCounts, QueueError, QueuePolicy, QueuedJob, StallReport,
    STALLED_REASON,
};

#[derive(Debug, Clone)]
struct Entry {
    job: QueuedJob,
    state: JobState,
    seq: u64,
    run_at: DateTime<Utc>,
    heartbeat_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    progress: u8,
    outcome: Option<Value>,
    failed_reason: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<Uuid, Entry>,
    next_seq: u64,
}

impl State {
    fn entry_mut(&mut self, id: Uuid) -> Result<&mut Entry, QueueError> {
        self.entries.get_mut(&id).ok_or(QueueError::UnknownJob(id))
    }

    fn active_mut(&mut self, id: Uuid) -> Result<&mut Entry, QueueError> {
        let entry = self.entry_mut(id)?;
        if entry.state != JobState::Active {
            return Err(QueueError::LostJob(id));
        }
        Ok(entry)
    }

    /// Keeps the newest `keep` finished jobs in `state`.
    fn trim(&mut self, state: JobState, keep: usize) {
        let mut finished: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.state == state)
            .map(|e| (e.finished_at, e.seq, e.job.id))
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort_unstable_by(|a, b| b.cmp(a));
        for (_, _, id) in finished.into_iter().skip(keep) {
            self.entries.remove(&id);
        }
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    policy: QueuePolicy,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(State::default()),
        }
    }

    pub async fn state_of(&self, id: Uuid) -> Option<JobState> {
        self.state.lock().await.entries.get(&id).map(|e| e.state)
    }

    pub async fn progress_of(&self, id: Uuid) -> Option<u8> {
        self.state.lock().await.entries.get(&id).map(|e| e.progress)
    }

    pub async fn outcome_of(&self, id: Uuid) -> Option<Value> {
        self.state
            .lock()
            .await
            .entries
            .get(&id)
            .and_then(|e| e.outcome.clone())
    }

    pub async fn failed_reason_of(&self, id: Uuid) -> Option<String> {
        self.state
            .lock()
            .await
            .entries
            .get(&id)
            .and_then(|e| e.failed_reason.clone())
    }

    /// Pending jobs in dequeue order, ignoring delays.
    pub async fn pending(&self) -> Vec<QueuedJob> {
        let state = self.state.lock().await;
        let mut pending: Vec<_> = state
            .entries
            .values()
            .filter(|e| e.state == JobState::Queued)
            .collect();
        pending.sort_by_key(|e| (std::cmp::Reverse(e.job.priority), e.run_at, e.seq));
        pending.into_iter().map(|e| e.job.clone()).collect()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError> {
        let mut state = self.state.lock().await;
        if let Some(stable_id) = &job.stable_id {
            state.entries.retain(|_, e| {
                !(e.state == JobState::Queued && e.job.stable_id.as_ref() == Some(stable_id))
            });
        }
        let id = Uuid::new_v4();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            id,
            Entry {
                job: QueuedJob {
                    id,
                    name: job.name,
                    data: job.data,
                    priority: job.priority,
                    attempts: 0,
                    stalled_count: 0,
                    stable_id: job.stable_id,
                },
                state: JobState::Queued,
                seq,
                run_at: after(Utc::now(), job.delay),
                heartbeat_at: None,
                finished_at: None,
                progress: 0,
                outcome: None,
                failed_reason: None,
            },
        );
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let next = state
            .entries
            .values()
            .filter(|e| e.state == JobState::Queued && e.run_at <= now)
            .min_by_key(|e| (std::cmp::Reverse(e.job.priority), e.run_at, e.seq))
            .map(|e| e.job.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let entry = state.entry_mut(id)?;
        entry.state = JobState::Active;
        entry.job.attempts += 1;
        entry.heartbeat_at = Some(now);
        entry.progress = 0;
        Ok(Some(entry.job.clone()))
    }

    async fn heartbeat(&self, id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.active_mut(id)?.heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn progress(&self, id: Uuid, percent: u8) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let entry = state.active_mut(id)?;
        entry.progress = percent.min(100);
        entry.heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn complete(&self, id: Uuid, outcome: Value) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let entry = state.active_mut(id)?;
        entry.state = JobState::Completed;
        entry.finished_at = Some(Utc::now());
        entry.progress = 100;
        entry.outcome = Some(outcome);
        state.trim(JobState::Completed, self.policy.keep_completed);
        Ok(())
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<JobState, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let entry = state.active_mut(id)?;
        entry.failed_reason = Some(reason.to_string());
        if entry.job.attempts < self.policy.max_attempts {
            entry.state = JobState::Queued;
            entry.run_at = after(now, self.policy.retry_delay(entry.job.attempts));
            debug!(job_id = %id, attempts = entry.job.attempts, "requeued failed job");
            return Ok(JobState::Queued);
        }
        entry.state = JobState::Failed;
        entry.finished_at = Some(now);
        state.trim(JobState::Failed, self.policy.keep_failed);
        Ok(JobState::Failed)
    }

    async fn reap_stalled(&self, stall_timeout: Duration) -> Result<StallReport, QueueError> {
        let now = Utc::now();
        let deadline = chrono::Duration::from_std(stall_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut report = StallReport::default();
        let mut state = self.state.lock().await;
        for entry in state.entries.values_mut() {
            let stale = entry.state == JobState::Active
                && entry
                    .heartbeat_at
                    .map_or(true, |beat| now.signed_duration_since(beat) >= deadline);
            if !stale {
                continue;
            }
            entry.job.stalled_count += 1;
            if entry.job.stalled_count > self.policy.max_stalled_count {
                entry.state = JobState::Failed;
                entry.finished_at = Some(now);
                entry.failed_reason = Some(STALLED_REASON.to_string());
                report.failed += 1;
            } else {
                entry.state = JobState::Queued;
                entry.run_at = now;
                report.requeued += 1;
            }
        }
        if report.failed > 0 {
            state.trim(JobState::Failed, self.policy.keep_failed);
        }
        Ok(report)
    }

    async fn clear_recurring(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| !(e.state == JobState::Queued && e.job.stable_id.is_some()));
        Ok(before - state.entries.len())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::new();
        for entry in state.entries.values() {
            *counts.entry(entry.state).or_default() += 1;
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
