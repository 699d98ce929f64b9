use portalis_connectors::{partition, AirQualityQuery};
use portalis_core::{AirQualityJobData, Domain, JobKind, JobOutcome};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{percent, ProgressSink, Processors};

impl Processors {
    /// One pass per parameter; each pass fans out over every country.
    pub(super) async fn air_quality(
        &self,
        data: &AirQualityJobData,
        progress: &dyn ProgressSink,
    ) -> JobOutcome {
        let mut outcome = JobOutcome::new(JobKind::AirQuality);
        let parameters = data.effective_parameters();
        let limit = data.limit_per_parameter();
        let hours_back = data.effective_hours_back();
        let total = parameters.len();
        info!(
            countries = data.countries.len(),
            parameters = total,
            limit_per_parameter = limit,
            hours_back,
            "processing air quality"
        );

        for (index, parameter) in parameters.iter().enumerate() {
            let unit = parameter.as_str();
            let span = info_span!("parameter", parameter = unit);
            async {
                let query = AirQualityQuery::recent(Some(*parameter), limit, hours_back);
                let settled = self
                    .sources
                    .air_quality
                    .fetch_countries(&data.countries, &query)
                    .await;
                let (records, failures) = partition(settled);
                for (country, err) in &failures {
                    if err.is_not_modified() {
                        debug!(country = %country, "air quality unchanged upstream");
                        continue;
                    }
                    warn!(country = %country, error = %err, "air quality fetch failed");
                    outcome.record_error(unit);
                }
                if records.is_empty() {
                    info!("no air quality records for parameter");
                }
                self.persist(Domain::AirQuality, unit, &records, &mut outcome, || {
                    self.gateway.insert_air_quality(&records)
                })
                .await;
            }
            .instrument(span)
            .await;

            progress.report(percent(index + 1, total)).await;
            Self::pause(self.settings.air_quality_delay, index + 1, total).await;
        }
        outcome
    }
}
