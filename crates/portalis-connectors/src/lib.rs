//! Source connectors: fetch one upstream API and normalize it into core records.
//!
//! Each connector sits behind a small trait so job processors can be driven by
//! fakes. The multi-unit helpers on those traits fan out concurrently and
//! settle every unit, so one failing country or indicator never voids the rest.

use std::future::Future;

use async_trait::async_trait;
use futures::future::join_all;
use portalis_core::{AdvisoryRecord, AirQualityRecord, IndicatorRecord};
use portalis_storage::FetchError;
use thiserror::Error;
use tracing::warn;

pub mod fcdo;
pub mod openaq;
pub mod state_dept;
pub mod worldbank;

pub use fcdo::FcdoConnector;
pub use openaq::{AirQualityQuery, OpenAqConnector};
pub use state_dept::StateDeptConnector;
pub use worldbank::WorldBankConnector;

pub const CRATE_NAME: &str = "portalis-connectors";

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected {upstream} payload: {message}")]
    Schema { upstream: String, message: String },
    #[error("upstream reported no changes")]
    NotModified,
}

impl ConnectorError {
    pub fn schema(upstream: &str, message: impl Into<String>) -> Self {
        Self::Schema {
            upstream: upstream.to_string(),
            message: message.into(),
        }
    }

    /// The upstream answered 304; nothing new to store, nothing failed.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::NotModified)
    }

    /// True when the failure was a certificate verification error.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_tls())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Fetch(err) => err.status(),
            _ => None,
        }
    }
}

/// Outcome of one unit (indicator code, slug, country) in a fan-out.
#[derive(Debug)]
pub struct Settled<T> {
    pub unit: String,
    pub result: Result<Vec<T>, ConnectorError>,
}

/// Await every unit concurrently, keeping each unit's result.
pub async fn settle_all<T, Fut>(units: Vec<(String, Fut)>) -> Vec<Settled<T>>
where
    Fut: Future<Output = Result<Vec<T>, ConnectorError>>,
{
    join_all(units.into_iter().map(|(unit, fut)| async move {
        Settled {
            unit,
            result: fut.await,
        }
    }))
    .await
}

/// Split settled units into the flattened successes and the failures.
pub fn partition<T>(settled: Vec<Settled<T>>) -> (Vec<T>, Vec<(String, ConnectorError)>) {
    let mut records = Vec::new();
    let mut failures = Vec::new();
    for Settled { unit, result } in settled {
        match result {
            Ok(mut batch) => records.append(&mut batch),
            Err(err) => failures.push((unit, err)),
        }
    }
    (records, failures)
}

/// Keep only fulfilled units; failures are logged and dropped.
pub fn fulfilled<T>(settled: Vec<Settled<T>>) -> Vec<T> {
    let (records, failures) = partition(settled);
    for (unit, err) in failures {
        warn!(unit = %unit, error = %err, "unit failed, keeping the others");
    }
    records
}

#[async_trait]
pub trait IndicatorSource: Send + Sync {
    async fn fetch_indicator(
        &self,
        indicator: &str,
        iso2: &str,
        since: i32,
    ) -> Result<Vec<IndicatorRecord>, ConnectorError>;

    /// One unit per indicator code.
    async fn fetch_indicators(
        &self,
        indicators: &[String],
        iso2: &str,
        since: i32,
    ) -> Vec<Settled<IndicatorRecord>> {
        let units = indicators
            .iter()
            .map(|code| (code.clone(), self.fetch_indicator(code, iso2, since)))
            .collect();
        settle_all(units).await
    }
}

#[async_trait]
pub trait UsAdvisorySource: Send + Sync {
    async fn fetch_us_advisories(&self) -> Result<Vec<AdvisoryRecord>, ConnectorError>;
}

#[async_trait]
pub trait UkAdvisorySource: Send + Sync {
    async fn fetch_uk_advisory(&self, slug: &str) -> Result<AdvisoryRecord, ConnectorError>;

    /// One unit per path slug.
    async fn fetch_uk_advisories(&self, slugs: &[String]) -> Vec<Settled<AdvisoryRecord>> {
        let units = slugs
            .iter()
            .map(|slug| {
                let fut = async move { self.fetch_uk_advisory(slug).await.map(|r| vec![r]) };
                (slug.clone(), fut)
            })
            .collect();
        settle_all(units).await
    }
}

#[async_trait]
pub trait AirQualitySource: Send + Sync {
    async fn fetch_country(
        &self,
        iso2: &str,
        query: &AirQualityQuery,
    ) -> Result<Vec<AirQualityRecord>, ConnectorError>;

    /// One unit per country.
    async fn fetch_countries(
        &self,
        countries: &[String],
        query: &AirQualityQuery,
    ) -> Vec<Settled<AirQualityRecord>> {
        let units = countries
            .iter()
            .map(|iso2| (iso2.clone(), self.fetch_country(iso2, query)))
            .collect();
        settle_all(units).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use portalis_core::AirQualityParameter;

    struct FlakySource;

    #[async_trait]
    impl AirQualitySource for FlakySource {
        async fn fetch_country(
            &self,
            iso2: &str,
            query: &AirQualityQuery,
        ) -> Result<Vec<AirQualityRecord>, ConnectorError> {
            if iso2 == "ES" {
                return Err(FetchError::HttpStatus {
                    status: 503,
                    url: "https://api.openaq.org/v3/measurements".into(),
                }
                .into());
            }
            Ok((0..2)
                .map(|i| AirQualityRecord {
                    country_iso2: iso2.to_string(),
                    city: format!("City {i}"),
                    parameter: query.parameter.unwrap_or(AirQualityParameter::Pm25),
                    ts: Utc::now(),
                    value: Some(i as f64),
                    unit: "µg/m³".into(),
                    source: "openaq".into(),
                })
                .collect())
        }
    }

    fn countries(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn one_failing_country_does_not_void_the_rest() {
        let query = AirQualityQuery::recent(Some(AirQualityParameter::No2), 10, 24);
        let settled = FlakySource
            .fetch_countries(&countries(&["DE", "ES", "FR"]), &query)
            .await;
        assert_eq!(settled.len(), 3);

        let (records, failures) = partition(settled);
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.country_iso2 != "ES"));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "ES");
        assert_eq!(failures[0].1.status(), Some(503));
    }

    #[tokio::test]
    async fn fulfilled_flattens_successes_in_unit_order() {
        let query = AirQualityQuery::recent(None, 10, 24);
        let settled = FlakySource
            .fetch_countries(&countries(&["FR", "ES", "DE"]), &query)
            .await;
        let records = fulfilled(settled);
        let order: Vec<_> = records.iter().map(|r| r.country_iso2.as_str()).collect();
        assert_eq!(order, ["FR", "FR", "DE", "DE"]);
    }

    #[test]
    fn tls_failures_are_recognized_through_the_wrapper() {
        let err = ConnectorError::from(FetchError::Tls {
            url: "https://cadataapi.state.gov".into(),
            message: "invalid peer certificate: UnknownIssuer".into(),
        });
        assert!(err.is_tls());
        assert!(!ConnectorError::NotModified.is_tls());
    }

    #[test]
    fn only_an_unchanged_upstream_counts_as_not_modified() {
        assert!(ConnectorError::NotModified.is_not_modified());
        assert!(!ConnectorError::schema("fcdo", "no content").is_not_modified());
        let err = ConnectorError::from(FetchError::HttpStatus {
            status: 404,
            url: "https://www.gov.uk/api/content/foreign-travel-advice/x".into(),
        });
        assert!(!err.is_not_modified());
    }
}
