//! Ingestion worker: configuration, job queue, processors, recurring
//! schedule, fallback replay and the long-running runtime.

pub mod config;
pub mod processors;
pub mod queue;
pub mod replay;
pub mod runtime;
pub mod schedule;

pub use config::WorkerConfig;
pub use processors::{NoProgress, ProcessorSettings, Processors, ProgressSink, Sources};
pub use queue::{JobQueue, JobState, MemoryQueue, NewJob, PgQueue, QueueError, QueuePolicy};
pub use replay::{replay_fallback, ReplaySummary};
pub use runtime::{
    build_gateway, build_processors, connect_queue, run_once, run_worker, HealthReport, Worker,
};
pub use schedule::{schedule_jobs, RecurringScheduler};

pub const CRATE_NAME: &str = "portalis-worker";
