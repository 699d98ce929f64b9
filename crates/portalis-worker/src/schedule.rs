//! Recurring job definitions and the start-up kick-start plan.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use portalis_core::{AdvisoryJobData, AirQualityJobData, IndicatorJobData, JobKind, JobSpec};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::queue::{JobQueue, NewJob};

const KICKSTART_AIR_QUALITY_COUNTRIES: usize = 10;
const KICKSTART_INDICATOR_COUNTRIES: usize = 8;

/// A job re-enqueued every `every` under a stable id.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringDefinition {
    pub stable_id: &'static str,
    pub every: Duration,
    pub spec: JobSpec,
}

impl RecurringDefinition {
    pub fn job(&self) -> NewJob {
        NewJob::for_spec(&self.spec).stable_id(self.stable_id)
    }
}

/// Air quality is only scheduled when an OpenAQ key is configured.
pub fn recurring_plan(config: &WorkerConfig) -> Vec<RecurringDefinition> {
    let mut plan = vec![
        RecurringDefinition {
            stable_id: JobKind::Indicators.recurring_id(),
            every: config.indicators_interval,
            spec: JobSpec::Indicators(IndicatorJobData::full_profile(&config.countries)),
        },
        RecurringDefinition {
            stable_id: JobKind::Advisories.recurring_id(),
            every: config.advisories_interval,
            spec: JobSpec::Advisories(AdvisoryJobData::us_only()),
        },
    ];
    if config.openaq_api_key.is_some() {
        plan.push(RecurringDefinition {
            stable_id: JobKind::AirQuality.recurring_id(),
            every: config.air_quality_interval,
            spec: JobSpec::AirQuality(AirQualityJobData::essential(&config.countries)),
        });
    }
    plan
}

fn head(countries: &[String], n: usize) -> &[String] {
    &countries[..n.min(countries.len())]
}

/// One-off jobs that produce early data: cheap sources first, expensive last.
pub fn kickstart_plan(config: &WorkerConfig) -> Vec<NewJob> {
    let mut jobs = vec![NewJob::for_spec(&JobSpec::Advisories(AdvisoryJobData::us_only()))
        .priority(10)
        .delay(Duration::from_secs(1))];
    if config.openaq_api_key.is_some() {
        jobs.push(
            NewJob::for_spec(&JobSpec::AirQuality(AirQualityJobData::recent(head(
                &config.countries,
                KICKSTART_AIR_QUALITY_COUNTRIES,
            ))))
            .priority(5)
            .delay(Duration::from_secs(5)),
        );
    }
    jobs.push(
        NewJob::for_spec(&JobSpec::Indicators(IndicatorJobData::economic(head(
            &config.countries,
            KICKSTART_INDICATOR_COUNTRIES,
        ))))
        .priority(1)
        .delay(Duration::from_secs(10)),
    );
    jobs
}

/// Drives recurring definitions off a `tokio-cron-scheduler` instance.
pub struct RecurringScheduler {
    scheduler: JobScheduler,
    queue: Arc<dyn JobQueue>,
    registered: BTreeMap<&'static str, Uuid>,
}

impl RecurringScheduler {
    pub async fn new(queue: Arc<dyn JobQueue>) -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self {
            scheduler,
            queue,
            registered: BTreeMap::new(),
        })
    }

    /// Registering an id twice replaces the earlier definition.
    pub async fn register(&mut self, definition: RecurringDefinition) -> Result<Uuid> {
        if let Some(previous) = self.registered.remove(definition.stable_id) {
            self.scheduler
                .remove(&previous)
                .await
                .with_context(|| format!("replacing recurring job {}", definition.stable_id))?;
        }

        let queue = self.queue.clone();
        let stable_id = definition.stable_id;
        let template = definition.job();
        let job = Job::new_repeated_async(definition.every, move |_uuid, _l| {
            let queue = queue.clone();
            let job = template.clone();
            Box::pin(async move {
                match queue.enqueue(job).await {
                    Ok(id) => info!(recurring = stable_id, job_id = %id, "enqueued recurring job"),
                    Err(err) => error!(recurring = stable_id, error = %err, "failed to enqueue recurring job"),
                }
            })
        })
        .with_context(|| format!("creating recurring job {stable_id}"))?;

        let uuid = self
            .scheduler
            .add(job)
            .await
            .with_context(|| format!("adding recurring job {stable_id}"))?;
        self.registered.insert(stable_id, uuid);
        info!(
            recurring = stable_id,
            every_ms = u64::try_from(definition.every.as_millis()).unwrap_or(u64::MAX),
            "registered recurring job"
        );
        Ok(uuid)
    }

    pub fn registered(&self) -> Vec<&'static str> {
        self.registered.keys().copied().collect()
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await.context("starting scheduler")
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler.shutdown().await.context("stopping scheduler")
    }
}

/// Clears recurring leftovers, registers the recurring plan, then enqueues
/// the kick-start jobs.
pub async fn schedule_jobs(
    queue: &Arc<dyn JobQueue>,
    scheduler: &mut RecurringScheduler,
    config: &WorkerConfig,
) -> Result<()> {
    let cleared = queue
        .clear_recurring()
        .await
        .context("clearing recurring jobs")?;
    info!(cleared, "scheduling recurring jobs");

    if config.openaq_api_key.is_none() {
        warn!("OpenAQ API key not configured - skipping air quality collection");
    }
    for definition in recurring_plan(config) {
        scheduler.register(definition).await?;
    }

    for job in kickstart_plan(config) {
        let name = job.name.clone();
        let id = queue
            .enqueue(job)
            .await
            .with_context(|| format!("enqueueing kick-start job {name}"))?;
        info!(job = %name, job_id = %id, "enqueued kick-start job");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use serde_json::json;

    fn config(openaq: Option<&str>) -> WorkerConfig {
        WorkerConfig {
            openaq_api_key: openaq.map(str::to_string),
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn recurring_plan_uses_stable_ids_and_intervals() {
        let plan = recurring_plan(&config(Some("key")));
        let ids: Vec<_> = plan.iter().map(|d| d.stable_id).collect();
        assert_eq!(
            ids,
            ["worldbank-indicators-daily", "advisories-6hourly", "airquality-12hourly"]
        );
        assert_eq!(plan[0].every, Duration::from_millis(86_400_000));
        assert_eq!(plan[1].spec, JobSpec::Advisories(AdvisoryJobData::us_only()));
        assert_eq!(plan[0].job().stable_id.as_deref(), Some("worldbank-indicators-daily"));

        assert_eq!(recurring_plan(&config(None)).len(), 2);
    }

    #[test]
    fn kickstart_jobs_are_staggered_by_cost() {
        let jobs = kickstart_plan(&config(Some("key")));
        let shape: Vec<_> = jobs
            .iter()
            .map(|j| (j.name.as_str(), j.priority, j.delay.as_secs()))
            .collect();
        assert_eq!(
            shape,
            [("advisories", 10, 1), ("airquality", 5, 5), ("worldbank.indicators", 1, 10)]
        );
        assert_eq!(jobs[1].data["countries"].as_array().map(Vec::len), Some(10));
        assert_eq!(jobs[2].data["countries"].as_array().map(Vec::len), Some(8));
        assert!(jobs.iter().all(|j| j.stable_id.is_none()));
    }

    #[test]
    fn short_country_lists_are_not_overrun() {
        let mut cfg = config(None);
        cfg.countries = vec!["DE".into(), "ES".into()];
        let jobs = kickstart_plan(&cfg);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].data["countries"], json!(["DE", "ES"]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduling_clears_leftovers_and_enqueues_kickstarts() {
        let memory = Arc::new(MemoryQueue::default());
        let queue: Arc<dyn JobQueue> = memory.clone();
        queue
            .enqueue(NewJob::new("advisories", json!({})).stable_id("advisories-6hourly"))
            .await
            .expect("enqueue");

        let mut scheduler = RecurringScheduler::new(queue.clone()).await.expect("scheduler");
        schedule_jobs(&queue, &mut scheduler, &config(Some("key")))
            .await
            .expect("schedule");

        let pending = memory.pending().await;
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|j| j.stable_id.is_none()));
        assert_eq!(scheduler.registered().len(), 3);

        let again = recurring_plan(&config(Some("key"))).remove(1);
        scheduler.register(again).await.expect("re-register");
        assert_eq!(scheduler.registered().len(), 3);
    }
}
