//! Worker runtime: job loop, stall reaper, periodic health check, and the
//! shutdown coordinator that releases the queue, store, and scheduler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use portalis_core::{JobOutcome, JobSpec};
use portalis_storage::{ClickHouseClient, FallbackStore, HttpFetcher, StorageGateway};
use serde_json::Value;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::processors::{NoProgress, ProgressSink, Processors, Sources};
use crate::queue::{JobQueue, JobState, MemoryQueue, PgQueue, QueueError, QueuedJob};
use crate::schedule::{schedule_jobs, RecurringScheduler};

/// Consecutive dequeue failures treated as a lost queue connection.
pub const MAX_CONSECUTIVE_QUEUE_ERRORS: u32 = 5;
const IDLE_POLL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub async fn connect_queue(config: &WorkerConfig) -> Result<Arc<dyn JobQueue>> {
    match &config.queue_database_url {
        Some(url) => {
            let queue = PgQueue::connect(url, config.queue_policy())
                .await
                .context("connecting to the job queue database")?;
            queue
                .ensure_schema()
                .await
                .context("preparing the job queue schema")?;
            Ok(Arc::new(queue))
        }
        None => {
            warn!("QUEUE_DATABASE_URL not set - using an in-memory queue; jobs do not survive restarts");
            Ok(Arc::new(MemoryQueue::new(config.queue_policy())))
        }
    }
}

pub fn build_gateway(config: &WorkerConfig) -> Result<StorageGateway> {
    let client = ClickHouseClient::new(config.clickhouse()).context("building ClickHouse client")?;
    Ok(StorageGateway::new(Arc::new(client)))
}

pub fn build_processors(config: &WorkerConfig, gateway: StorageGateway) -> Result<Processors> {
    let http = HttpFetcher::new(config.http_client()).context("building HTTP client")?;
    Ok(Processors::new(
        Sources::live(http, config.openaq_api_key.clone()),
        gateway,
        FallbackStore::new(&config.fallback_dir),
        config.processor_settings(),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub queue: bool,
    pub store: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.queue && self.store
    }
}

/// Forwards processor progress to the queue, which also refreshes the heartbeat.
struct QueueProgress {
    queue: Arc<dyn JobQueue>,
    job_id: Uuid,
}

#[async_trait]
impl ProgressSink for QueueProgress {
    async fn report(&self, percent: u8) {
        debug!(job_id = %self.job_id, percent, "job progress");
        match self.queue.progress(self.job_id, percent).await {
            Ok(()) => {}
            Err(QueueError::LostJob(_)) => {
                debug!(job_id = %self.job_id, "progress ignored for a job no longer active")
            }
            Err(err) => warn!(job_id = %self.job_id, error = %err, "failed to record progress"),
        }
    }
}

async fn heartbeat_loop(
    queue: Arc<dyn JobQueue>,
    job_id: Uuid,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                match queue.heartbeat(job_id).await {
                    Ok(()) => {}
                    Err(QueueError::LostJob(_)) => {
                        warn!(job_id = %job_id, "job was taken back by the queue; stopping heartbeat");
                        break;
                    }
                    Err(err) => warn!(job_id = %job_id, error = %err, "heartbeat failed"),
                }
            }
        }
    }
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    gateway: StorageGateway,
    processors: Processors,
    concurrency: usize,
    stalled_interval: Duration,
    health_interval: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        gateway: StorageGateway,
        processors: Processors,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            gateway,
            processors,
            concurrency: config.concurrency.max(1),
            stalled_interval: config.stalled_interval.max(MIN_INTERVAL),
            health_interval: config.health_interval.max(MIN_INTERVAL),
        }
    }

    /// Never fails; an unhealthy dependency only means degraded mode.
    pub async fn health_check(&self) -> HealthReport {
        let queue = match self.queue.ping().await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "job queue health check failed");
                false
            }
        };
        let store = self.gateway.ping().await;
        if !store {
            warn!("ClickHouse not available - continuing in degraded mode");
        }
        HealthReport { queue, store }
    }

    /// Claims and runs one due job. Returns false when nothing was due.
    pub async fn process_next(&self) -> Result<bool, QueueError> {
        match self.queue.dequeue().await? {
            Some(job) => {
                self.process_job(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn process_job(&self, job: QueuedJob) -> Result<(), QueueError> {
        let span = info_span!("job", job_id = %job.id, name = %job.name, attempt = job.attempts);
        async {
            let spec = match JobSpec::decode(&job.name, &job.data) {
                Ok(spec) => spec,
                Err(err) => {
                    error!(error = %err, "rejecting job");
                    match self.queue.fail(job.id, &err.to_string()).await {
                        Ok(JobState::Queued) => warn!("job requeued for another attempt"),
                        Ok(_) => {}
                        Err(QueueError::LostJob(_)) => warn!("job no longer active; failure dropped"),
                        Err(err) => return Err(err),
                    }
                    return Ok(());
                }
            };
            info!("job started");

            let started = Instant::now();
            let stop = CancellationToken::new();
            let beats = tokio::spawn(heartbeat_loop(
                self.queue.clone(),
                job.id,
                (self.stalled_interval / 3).max(MIN_INTERVAL),
                stop.clone(),
            ));
            let progress = QueueProgress {
                queue: self.queue.clone(),
                job_id: job.id,
            };
            let outcome = self.processors.run(&spec, &progress).await;
            stop.cancel();
            if let Err(err) = beats.await {
                warn!(error = %err, "heartbeat task ended abnormally");
            }

            let summary = serde_json::to_value(&outcome).unwrap_or(Value::Null);
            match self.queue.complete(job.id, summary).await {
                Ok(()) => {}
                Err(QueueError::LostJob(_)) => {
                    warn!(
                        total_processed = outcome.total_processed,
                        "job was requeued or failed while running; completion dropped"
                    );
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
            info!(
                duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                total_processed = outcome.total_processed,
                total_errors = outcome.total_errors,
                "job completed"
            );
            Ok::<(), QueueError>(())
        }
        .instrument(span)
        .await
    }

    async fn work_loop(self: Arc<Self>, slot: usize, shutdown: CancellationToken) -> Result<()> {
        info!(slot, "worker loop started");
        let mut consecutive_errors = 0;
        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(true) => consecutive_errors = 0,
                Ok(false) => {
                    consecutive_errors = 0;
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
                Err(err) => {
                    consecutive_errors += 1;
                    error!(slot, error = %err, consecutive_errors, "job queue error");
                    if consecutive_errors >= MAX_CONSECUTIVE_QUEUE_ERRORS {
                        return Err(anyhow!(err).context("lost the job queue connection"));
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL * consecutive_errors) => {}
                    }
                }
            }
        }
        info!(slot, "worker loop stopped");
        Ok(())
    }

    async fn reaper_loop(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.stalled_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => match self.queue.reap_stalled(self.stalled_interval).await {
                    Ok(report) if report.requeued + report.failed > 0 => {
                        warn!(requeued = report.requeued, failed = report.failed, "stalled jobs detected");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "stalled job check failed"),
                },
            }
        }
    }

    async fn health_loop(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.health_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if !self.health_check().await.is_healthy() {
                        warn!("health check failed - continuing in degraded mode");
                    }
                }
            }
        }
    }

    /// Runs until `shutdown` fires or a background task fails, then releases
    /// every long-lived resource. Any failure on the way out is returned.
    pub async fn run(
        self: Arc<Self>,
        mut scheduler: RecurringScheduler,
        shutdown: CancellationToken,
    ) -> Result<()> {
        scheduler.start().await?;
        let mut tasks = JoinSet::new();
        for slot in 0..self.concurrency {
            tasks.spawn(self.clone().work_loop(slot, shutdown.clone()));
        }
        tasks.spawn(self.clone().reaper_loop(shutdown.clone()));
        tasks.spawn(self.clone().health_loop(shutdown.clone()));
        info!(concurrency = self.concurrency, "ingestion worker started");

        let mut failure: Option<anyhow::Error> = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        error!(error = %err, "background task failed, shutting down");
                        failure = Some(err);
                        break;
                    }
                    Some(Err(err)) => {
                        error!(error = %err, "background task panicked, shutting down");
                        failure = Some(anyhow!(err));
                        break;
                    }
                },
            }
        }

        info!("starting graceful shutdown");
        shutdown.cancel();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("in-flight work did not finish in time; stalled-job detection will requeue it");
            tasks.abort_all();
        }

        let mut problems = Vec::new();
        if let Err(err) = scheduler.shutdown().await {
            problems.push(format!("scheduler: {err:#}"));
        }
        if let Err(err) = self.queue.close().await {
            problems.push(format!("queue: {err}"));
        }
        if let Err(err) = self.gateway.close().await {
            problems.push(format!("store: {err}"));
        }

        match (failure, problems.is_empty()) {
            (Some(err), _) => Err(err),
            (None, false) => {
                error!(problems = ?problems, "error during shutdown");
                Err(anyhow!("error during shutdown: {}", problems.join("; ")))
            }
            (None, true) => {
                info!("graceful shutdown completed");
                Ok(())
            }
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}

/// Full worker lifecycle from configuration to exit.
pub async fn run_worker(config: WorkerConfig) -> Result<()> {
    info!(
        countries = config.countries.len(),
        clickhouse = %config.clickhouse_url,
        durable_queue = config.queue_database_url.is_some(),
        "starting Portalis ingestion worker"
    );
    for warning in config.api_key_warnings() {
        warn!("{warning}");
    }

    let queue = connect_queue(&config).await?;
    let gateway = build_gateway(&config)?;
    let processors = build_processors(&config, gateway.clone())?;
    let worker = Arc::new(Worker::new(queue.clone(), gateway, processors, &config));

    if worker.health_check().await.is_healthy() {
        info!("all services healthy - live data mode");
    } else {
        warn!("some services not available - running in degraded mode");
    }

    let mut scheduler = RecurringScheduler::new(queue.clone()).await?;
    schedule_jobs(&queue, &mut scheduler, &config).await?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    worker.run(scheduler, shutdown).await
}

/// Runs one job inline, without the queue.
pub async fn run_once(config: &WorkerConfig, spec: &JobSpec) -> Result<JobOutcome> {
    spec.validate()?;
    let gateway = build_gateway(config)?;
    let processors = build_processors(config, gateway.clone())?;
    let outcome = processors.run(spec, &NoProgress).await;
    if let Err(err) = gateway.close().await {
        warn!(error = %err, "failed to close the store connection");
    }
    Ok(outcome)
}
