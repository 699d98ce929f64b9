use portalis_connectors::partition;
use portalis_core::{Domain, IndicatorJobData, JobKind, JobOutcome};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{percent, ProgressSink, Processors};

impl Processors {
    /// One unit per country; each country's indicator codes are fetched together.
    pub(super) async fn indicators(
        &self,
        data: &IndicatorJobData,
        progress: &dyn ProgressSink,
    ) -> JobOutcome {
        let mut outcome = JobOutcome::new(JobKind::Indicators);
        let total = data.countries.len();
        info!(
            countries = total,
            indicators = data.indicators.len(),
            since = data.since,
            "processing World Bank indicators"
        );

        for (index, country) in data.countries.iter().enumerate() {
            let span = info_span!("country", country = %country);
            async {
                let settled = self
                    .sources
                    .indicators
                    .fetch_indicators(&data.indicators, country, data.since)
                    .await;
                let (records, failures) = partition(settled);
                for (code, err) in &failures {
                    if err.is_not_modified() {
                        debug!(indicator = %code, "indicator unchanged upstream");
                        continue;
                    }
                    warn!(indicator = %code, error = %err, "indicator fetch failed");
                    outcome.record_error(country);
                }
                if records.is_empty() {
                    info!("no indicator records for country");
                }
                self.persist(Domain::Indicators, country, &records, &mut outcome, || {
                    self.gateway.insert_indicators(&records)
                })
                .await;
            }
            .instrument(span)
            .await;

            progress.report(percent(index + 1, total)).await;
            Self::pause(self.settings.indicator_delay, index + 1, total).await;
        }
        outcome
    }
}
