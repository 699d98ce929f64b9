//! Job processors: walk a job's units sequentially, persist each unit's
//! records, and summarize the run as a [`JobOutcome`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portalis_connectors::{
    AirQualitySource, FcdoConnector, IndicatorSource, OpenAqConnector, StateDeptConnector,
    UkAdvisorySource, UsAdvisorySource, WorldBankConnector,
};
use portalis_core::{Domain, JobOutcome, JobSpec};
use portalis_storage::{FallbackStore, GatewayError, HttpFetcher, StorageGateway};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

mod advisories;
mod air_quality;
mod indicators;

pub use advisories::synthetic_us_advisories;

/// Receives fractional progress (0..=100) for the running job.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, percent: u8);
}

pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _percent: u8) {}
}

pub(crate) fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from((done.min(total) * 100) / total).unwrap_or(100)
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub indicator_delay: Duration,
    pub advisory_delay: Duration,
    pub air_quality_delay: Duration,
    pub synthetic_advisories_on_tls_failure: bool,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            indicator_delay: Duration::from_millis(500),
            advisory_delay: Duration::from_millis(1000),
            air_quality_delay: Duration::from_millis(2000),
            synthetic_advisories_on_tls_failure: false,
        }
    }
}

impl ProcessorSettings {
    /// No inter-unit pauses; for tests and one-off runs against fakes.
    pub fn without_delays() -> Self {
        Self {
            indicator_delay: Duration::ZERO,
            advisory_delay: Duration::ZERO,
            air_quality_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Upstream sources a processor may call.
#[derive(Clone)]
pub struct Sources {
    pub indicators: Arc<dyn IndicatorSource>,
    pub us_advisories: Arc<dyn UsAdvisorySource>,
    pub uk_advisories: Arc<dyn UkAdvisorySource>,
    pub air_quality: Arc<dyn AirQualitySource>,
}

impl Sources {
    pub fn live(http: HttpFetcher, openaq_api_key: Option<String>) -> Self {
        Self {
            indicators: Arc::new(WorldBankConnector::new(http.clone())),
            us_advisories: Arc::new(StateDeptConnector::new(http.clone())),
            uk_advisories: Arc::new(FcdoConnector::new(http.clone())),
            air_quality: Arc::new(OpenAqConnector::new(http, openaq_api_key)),
        }
    }
}

#[derive(Clone)]
pub struct Processors {
    sources: Sources,
    gateway: StorageGateway,
    fallback: FallbackStore,
    settings: ProcessorSettings,
}

impl Processors {
    pub fn new(
        sources: Sources,
        gateway: StorageGateway,
        fallback: FallbackStore,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            sources,
            gateway,
            fallback,
            settings,
        }
    }

    /// Runs one job to completion. Per-unit failures are counted in the
    /// outcome and never abort the run.
    pub async fn run(&self, spec: &JobSpec, progress: &dyn ProgressSink) -> JobOutcome {
        let kind = spec.kind();
        let span = info_span!("job_run", job = kind.queue_name());
        async move {
            progress.report(0).await;
            let outcome = match spec {
                JobSpec::Indicators(data) => self.indicators(data, progress).await,
                JobSpec::Advisories(data) => self.advisories(data, progress).await,
                JobSpec::AirQuality(data) => self.air_quality(data, progress).await,
            };
            progress.report(100).await;
            info!(
                total_processed = outcome.total_processed,
                total_errors = outcome.total_errors,
                fallback_records = outcome.fallback_records,
                "job finished"
            );
            outcome
        }
        .instrument(span)
        .await
    }

    /// Writes one unit's records, diverting them to the fallback store when
    /// the analytical store rejects the batch.
    async fn persist<T, F, Fut>(
        &self,
        domain: Domain,
        unit: &str,
        records: &[T],
        outcome: &mut JobOutcome,
        insert: F,
    ) where
        T: Serialize + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<usize, GatewayError>>,
    {
        if records.is_empty() {
            return;
        }
        let err = match insert().await {
            Ok(written) => {
                info!(domain = %domain, unit, records = written, "stored records");
                outcome.record_written(unit, written);
                return;
            }
            Err(err) => err,
        };
        if err.is_unavailable() {
            warn!(domain = %domain, unit, "storage unavailable, degraded mode: using fallback store");
        } else {
            warn!(domain = %domain, unit, error = %err, "insert failed, using fallback store");
        }
        match self.fallback.store(domain, records, unit).await {
            Some(_) => outcome.record_fallback(unit, records.len()),
            None => {
                error!(domain = %domain, unit, records = records.len(), "records could not be persisted anywhere");
                outcome.record_error(unit);
            }
        }
    }

    async fn pause(delay: Duration, done: usize, total: usize) {
        if done < total && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
