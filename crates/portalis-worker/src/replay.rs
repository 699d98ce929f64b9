//! Replays fallback blobs into the analytical store.

use anyhow::{Context, Result};
use portalis_core::{AdvisoryRecord, AirQualityRecord, CostOfLivingRecord, Domain, IndicatorRecord};
use portalis_storage::{FallbackBlob, FallbackStore, StorageGateway};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub blobs_imported: usize,
    pub records_imported: usize,
    pub blobs_failed: usize,
}

/// A blob is removed only after its whole batch was accepted by the store.
pub async fn replay_fallback(
    fallback: &FallbackStore,
    gateway: &StorageGateway,
) -> Result<ReplaySummary> {
    let blobs = fallback.list().await.context("listing fallback blobs")?;
    info!(blobs = blobs.len(), "replaying fallback store");

    let mut summary = ReplaySummary::default();
    for blob in &blobs {
        match import_blob(fallback, gateway, blob).await {
            Ok(records) => {
                fallback.remove(blob).await?;
                summary.blobs_imported += 1;
                summary.records_imported += records;
                info!(domain = %blob.domain, unit = %blob.discriminator, records, "imported fallback blob");
            }
            Err(err) => {
                summary.blobs_failed += 1;
                warn!(path = %blob.path.display(), error = %err, "fallback blob left in place");
            }
        }
    }
    Ok(summary)
}

async fn import_blob(
    fallback: &FallbackStore,
    gateway: &StorageGateway,
    blob: &FallbackBlob,
) -> Result<usize> {
    let written = match blob.domain {
        Domain::Indicators => {
            let records: Vec<IndicatorRecord> = fallback.load(blob).await?;
            gateway.insert_indicators(&records).await?
        }
        Domain::Advisories => {
            let records: Vec<AdvisoryRecord> = fallback.load(blob).await?;
            gateway.insert_advisories(&records).await?
        }
        Domain::AirQuality => {
            let records: Vec<AirQualityRecord> = fallback.load(blob).await?;
            gateway.insert_air_quality(&records).await?
        }
        Domain::CostOfLiving => {
            let records: Vec<CostOfLivingRecord> = fallback.load(blob).await?;
            gateway.insert_cost_of_living(&records).await?
        }
    };
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use portalis_core::Metadata;
    use portalis_storage::{AnalyticsClient, GatewayError};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Store {
        down: AtomicBool,
        rows: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl AnalyticsClient for Store {
        async fn ping(&self) -> Result<(), GatewayError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(GatewayError::Unavailable("down".into()));
            }
            Ok(())
        }

        async fn insert_rows(&self, _table: &str, rows: Vec<Value>) -> Result<(), GatewayError> {
            self.rows.lock().expect("lock").extend(rows);
            Ok(())
        }

        async fn query_rows(
            &self,
            _sql: &str,
            _params: &[(&str, String)],
        ) -> Result<Vec<Value>, GatewayError> {
            Ok(Vec::new())
        }
    }

    fn indicator(year: i32) -> IndicatorRecord {
        IndicatorRecord {
            country_iso2: "DE".into(),
            source: "worldbank".into(),
            indicator_code: "SP.POP.TOTL".into(),
            period: NaiveDate::from_ymd_opt(year, 1, 1).expect("date"),
            value: Some(83_000_000.0),
            meta: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn imported_blobs_are_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fallback = FallbackStore::new(dir.path());
        fallback
            .store(Domain::Indicators, &[indicator(2021), indicator(2022)], "DE")
            .await
            .expect("stored");
        let store = Arc::new(Store::default());
        let gateway = StorageGateway::new(store.clone());

        let summary = replay_fallback(&fallback, &gateway).await.expect("replay");
        assert_eq!(
            summary,
            ReplaySummary {
                blobs_imported: 1,
                records_imported: 2,
                blobs_failed: 0
            }
        );
        assert_eq!(store.rows.lock().expect("lock").len(), 2);
        assert!(fallback.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn rejected_blobs_stay_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fallback = FallbackStore::new(dir.path());
        fallback
            .store(Domain::Indicators, &[indicator(2021)], "DE")
            .await
            .expect("stored");
        let store = Arc::new(Store::default());
        store.down.store(true, Ordering::SeqCst);
        let gateway = StorageGateway::new(store.clone());

        let summary = replay_fallback(&fallback, &gateway).await.expect("replay");
        assert_eq!(summary.blobs_failed, 1);
        assert_eq!(summary.blobs_imported, 0);
        assert_eq!(fallback.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn empty_store_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fallback = FallbackStore::new(dir.path().join("missing"));
        let gateway = StorageGateway::new(Arc::new(Store::default()));
        let summary = replay_fallback(&fallback, &gateway).await.expect("replay");
        assert_eq!(summary, ReplaySummary::default());
    }
}
