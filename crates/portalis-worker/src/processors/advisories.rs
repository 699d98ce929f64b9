use chrono::{DateTime, Utc};
use portalis_connectors::partition;
use portalis_core::{AdvisoryJobData, AdvisoryRecord, AdvisorySource, Domain, JobKind, JobOutcome, Metadata};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{percent, ProgressSink, Processors};

const SYNTHETIC_REASON: &str = "TLS certificate verification failed";

/// Placeholder US advisories written when the upstream certificate cannot be
/// verified. Every record is tagged `synthetic` and `mock` in its payload.
pub fn synthetic_us_advisories(now: DateTime<Utc>) -> Vec<AdvisoryRecord> {
    let placeholder = |iso2: &str, level: u8, headline: &str, page: &str| {
        let mut payload = Metadata::new();
        payload.insert("synthetic".into(), Value::Bool(true));
        payload.insert("mock".into(), Value::Bool(true));
        payload.insert("reason".into(), Value::from(SYNTHETIC_REASON));
        AdvisoryRecord {
            country_iso2: iso2.to_string(),
            source: portalis_connectors::state_dept::SOURCE.to_string(),
            level,
            headline: headline.to_string(),
            url: format!(
                "https://travel.state.gov/content/travel/en/traveladvisories/traveladvisories/{page}"
            ),
            published_at: now,
            payload,
        }
    };
    vec![
        placeholder("DE", 1, "Exercise Normal Precautions - Germany", "germany-travel-advisory.html"),
        placeholder("ES", 2, "Exercise Increased Caution - Spain", "spain-travel-advisory.html"),
    ]
}

impl Processors {
    /// One unit per source.
    pub(super) async fn advisories(
        &self,
        data: &AdvisoryJobData,
        progress: &dyn ProgressSink,
    ) -> JobOutcome {
        let mut outcome = JobOutcome::new(JobKind::Advisories);
        let total = data.sources.len();
        info!(sources = total, "processing travel advisories");

        for (index, source) in data.sources.iter().enumerate() {
            match source {
                AdvisorySource::UsStateDept => self.us_advisories(&mut outcome).await,
                AdvisorySource::FcdoUk => self.uk_advisories(data, &mut outcome).await,
            }
            progress.report(percent(index + 1, total)).await;
            Self::pause(self.settings.advisory_delay, index + 1, total).await;
        }
        outcome
    }

    async fn us_advisories(&self, outcome: &mut JobOutcome) {
        let unit = AdvisorySource::UsStateDept.as_str();
        let records = match self.sources.us_advisories.fetch_us_advisories().await {
            Ok(records) => records,
            Err(err) if err.is_not_modified() => {
                debug!(source = unit, "US State Department feed unchanged upstream");
                return;
            }
            Err(err) => {
                error!(source = unit, error = %err, "US State Department fetch failed");
                outcome.record_error(unit);
                if !err.is_tls() {
                    return;
                }
                if !self.settings.synthetic_advisories_on_tls_failure {
                    warn!("certificate verification failed; synthetic advisories are disabled");
                    return;
                }
                warn!("certificate verification failed; writing synthetic placeholder advisories");
                synthetic_us_advisories(Utc::now())
            }
        };
        if records.is_empty() {
            warn!(source = unit, "no US State Department advisories found");
        }
        self.persist(Domain::Advisories, unit, &records, outcome, || {
            self.gateway.insert_advisories(&records)
        })
        .await;
    }

    async fn uk_advisories(&self, data: &AdvisoryJobData, outcome: &mut JobOutcome) {
        let unit = AdvisorySource::FcdoUk.as_str();
        let slugs = data.uk_slugs();
        let settled = self.sources.uk_advisories.fetch_uk_advisories(&slugs).await;
        let (records, failures) = partition(settled);
        for (slug, err) in &failures {
            if err.is_not_modified() {
                debug!(slug = %slug, "FCDO advisory unchanged upstream");
                continue;
            }
            warn!(slug = %slug, error = %err, "FCDO advisory fetch failed");
            outcome.record_error(unit);
        }
        if records.is_empty() {
            warn!(source = unit, "no FCDO advisories found");
        }
        self.persist(Domain::Advisories, unit, &records, outcome, || {
            self.gateway.insert_advisories(&records)
        })
        .await;
    }
}
