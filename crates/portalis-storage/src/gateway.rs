//! Write path into the analytical store plus best-effort read helpers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portalis_core::{
    parse_timestamp, AdvisoryRecord, AirQualityRecord, CostOfLivingRecord, Domain,
    IndicatorRecord,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const STORE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("storage unavailable, running in degraded mode: {0}")]
    Unavailable(String),
    #[error("write to {table} failed: {message}")]
    Write { table: String, message: String },
    #[error("query failed: {0}")]
    Query(String),
    #[error("could not serialize rows for {table}: {message}")]
    Serialize { table: String, message: String },
}

impl GatewayError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Insert/query RPC of the analytical store.
#[async_trait]
pub trait AnalyticsClient: Send + Sync {
    async fn ping(&self) -> Result<(), GatewayError>;

    async fn insert_rows(&self, table: &str, rows: Vec<Value>) -> Result<(), GatewayError>;

    /// `params` bind `{name:Type}` placeholders in `sql`.
    async fn query_rows(
        &self,
        sql: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Value>, GatewayError>;

    async fn close(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct StorageGateway {
    client: Arc<dyn AnalyticsClient>,
}

impl std::fmt::Debug for StorageGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageGateway").finish_non_exhaustive()
    }
}

impl StorageGateway {
    pub fn new(client: Arc<dyn AnalyticsClient>) -> Self {
        Self { client }
    }

    pub async fn ping(&self) -> bool {
        match self.client.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "analytics store ping failed");
                false
            }
        }
    }

    /// Pings first; a failed ping yields [`GatewayError::Unavailable`].
    pub async fn insert_indicators(&self, records: &[IndicatorRecord]) -> Result<usize, GatewayError> {
        if records.is_empty() {
            debug!("no indicators to insert");
            return Ok(0);
        }
        self.verify_available().await?;
        let rows = records.iter().map(indicator_row).collect::<Result<Vec<_>, _>>()?;
        self.write(Domain::Indicators, rows).await
    }

    pub async fn insert_advisories(&self, records: &[AdvisoryRecord]) -> Result<usize, GatewayError> {
        if records.is_empty() {
            debug!("no advisories to insert");
            return Ok(0);
        }
        let rows = records.iter().map(advisory_row).collect::<Result<Vec<_>, _>>()?;
        self.write(Domain::Advisories, rows).await
    }

    /// Pings first; a failed ping yields [`GatewayError::Unavailable`].
    pub async fn insert_air_quality(
        &self,
        records: &[AirQualityRecord],
    ) -> Result<usize, GatewayError> {
        if records.is_empty() {
            debug!("no air quality measurements to insert");
            return Ok(0);
        }
        self.verify_available().await?;
        let rows = records.iter().map(air_quality_row).collect();
        self.write(Domain::AirQuality, rows).await
    }

    pub async fn insert_cost_of_living(
        &self,
        records: &[CostOfLivingRecord],
    ) -> Result<usize, GatewayError> {
        if records.is_empty() {
            debug!("no cost of living records to insert");
            return Ok(0);
        }
        let rows = records.iter().map(cost_of_living_row).collect();
        self.write(Domain::CostOfLiving, rows).await
    }

    async fn verify_available(&self) -> Result<(), GatewayError> {
        self.client.ping().await.map_err(|err| match err {
            GatewayError::Unavailable(message) => GatewayError::Unavailable(message),
            other => GatewayError::Unavailable(other.to_string()),
        })
    }

    async fn write(&self, domain: Domain, rows: Vec<Value>) -> Result<usize, GatewayError> {
        let count = rows.len();
        match self.client.insert_rows(domain.table(), rows).await {
            Ok(()) => {
                info!(table = domain.table(), records = count, "inserted rows");
                Ok(count)
            }
            Err(err) => {
                error!(table = domain.table(), records = count, error = %err, "insert failed");
                Err(err)
            }
        }
    }

    /// Newest `ingested_at` for a table and source, optionally per country.
    pub async fn last_ingestion_time(
        &self,
        domain: Domain,
        source: &str,
        country_iso2: Option<&str>,
    ) -> Option<DateTime<Utc>> {
        let mut sql = format!(
            "SELECT max(ingested_at) AS last_ingestion FROM {} WHERE source = {{source:String}}",
            domain.table()
        );
        let mut params = vec![("source", source.to_string())];
        if let Some(country) = country_iso2 {
            sql.push_str(" AND country_iso2 = {country:FixedString(2)}");
            params.push(("country", country.to_ascii_uppercase()));
        }

        let rows = self.best_effort_query(&sql, &params).await?;
        rows.first()
            .and_then(|row| row.get("last_ingestion"))
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .filter(|ts| ts.timestamp() > 0)
    }

    pub async fn latest_advisory(&self, country_iso2: &str) -> Option<Value> {
        let sql = "SELECT * FROM advisories WHERE country_iso2 = {country:FixedString(2)} \
                   ORDER BY published_at DESC LIMIT 1";
        let params = [("country", country_iso2.to_ascii_uppercase())];
        self.best_effort_query(sql, &params)
            .await?
            .into_iter()
            .next()
    }

    /// Latest value and period per indicator code and source for one country.
    pub async fn country_indicator_summary(&self, country_iso2: &str) -> Vec<Value> {
        let sql = "SELECT indicator_code, source, \
                   argMax(value, period) AS latest_value, \
                   argMax(period, period) AS latest_period, \
                   argMax(meta, period) AS latest_meta \
                   FROM indicators WHERE country_iso2 = {country:FixedString(2)} \
                   GROUP BY indicator_code, source ORDER BY indicator_code, source";
        let params = [("country", country_iso2.to_ascii_uppercase())];
        self.best_effort_query(sql, &params)
            .await
            .unwrap_or_default()
    }

    async fn best_effort_query(&self, sql: &str, params: &[(&str, String)]) -> Option<Vec<Value>> {
        match self.client.query_rows(sql, params).await {
            Ok(rows) => Some(rows),
            Err(err) => {
                error!(error = %err, "read query failed");
                None
            }
        }
    }

    pub async fn close(&self) -> Result<(), GatewayError> {
        self.client.close().await?;
        info!("analytics client closed");
        Ok(())
    }
}

fn store_time(ts: &DateTime<Utc>) -> String {
    ts.format(STORE_TIME_FORMAT).to_string()
}

fn encode_map(table: &str, map: &portalis_core::Metadata) -> Result<String, GatewayError> {
    serde_json::to_string(map).map_err(|e| GatewayError::Serialize {
        table: table.to_string(),
        message: e.to_string(),
    })
}

fn indicator_row(r: &IndicatorRecord) -> Result<Value, GatewayError> {
    Ok(json!({
        "country_iso2": r.country_iso2,
        "source": r.source,
        "indicator_code": r.indicator_code,
        "period": r.period.format("%Y-%m-%d").to_string(),
        "value": r.value,
        "meta": encode_map(Domain::Indicators.table(), &r.meta)?,
        "ingested_at": store_time(&Utc::now()),
    }))
}

fn advisory_row(r: &AdvisoryRecord) -> Result<Value, GatewayError> {
    Ok(json!({
        "country_iso2": r.country_iso2,
        "source": r.source,
        "level": r.level,
        "headline": r.headline,
        "url": r.url,
        "published_at": store_time(&r.published_at),
        "payload": encode_map(Domain::Advisories.table(), &r.payload)?,
        "ingested_at": store_time(&Utc::now()),
    }))
}

fn air_quality_row(r: &AirQualityRecord) -> Value {
    json!({
        "country_iso2": r.country_iso2,
        "city": r.city,
        "parameter": r.parameter.as_str(),
        "ts": store_time(&r.ts),
        "value": r.value,
        "unit": r.unit,
        "source": r.source,
        "ingested_at": store_time(&Utc::now()),
    })
}

fn cost_of_living_row(r: &CostOfLivingRecord) -> Value {
    json!({
        "country_iso2": r.country_iso2,
        "city": r.city,
        "category": r.category,
        "item": r.item,
        "value": r.value,
        "currency": r.currency,
        "period": r.period.format("%Y-%m-%d").to_string(),
        "source": r.source,
        "ingested_at": store_time(&Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use portalis_core::{AirQualityParameter, Metadata};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        down: AtomicBool,
        fail_queries: AtomicBool,
        pings: AtomicUsize,
        inserts: Mutex<Vec<(String, Vec<Value>)>>,
        query_result: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl AnalyticsClient for RecordingClient {
        async fn ping(&self) -> Result<(), GatewayError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(GatewayError::Query("connection refused".into()))
            } else {
                Ok(())
            }
        }

        async fn insert_rows(&self, table: &str, rows: Vec<Value>) -> Result<(), GatewayError> {
            self.inserts
                .lock()
                .expect("lock")
                .push((table.to_string(), rows));
            Ok(())
        }

        async fn query_rows(
            &self,
            _sql: &str,
            _params: &[(&str, String)],
        ) -> Result<Vec<Value>, GatewayError> {
            if self.fail_queries.load(Ordering::SeqCst) {
                return Err(GatewayError::Query("boom".into()));
            }
            Ok(self.query_result.lock().expect("lock").clone())
        }
    }

    fn indicator(value: Option<f64>) -> IndicatorRecord {
        IndicatorRecord {
            country_iso2: "DE".into(),
            source: "worldbank".into(),
            indicator_code: "SP.POP.TOTL".into(),
            period: NaiveDate::from_ymd_opt(2022, 1, 1).expect("date"),
            value,
            meta: Metadata::new(),
        }
    }

    fn gateway() -> (Arc<RecordingClient>, StorageGateway) {
        let client = Arc::new(RecordingClient::default());
        (client.clone(), StorageGateway::new(client))
    }

    #[tokio::test]
    async fn empty_batches_make_no_calls() {
        let (client, gateway) = gateway();
        assert_eq!(gateway.insert_indicators(&[]).await.expect("ok"), 0);
        assert_eq!(gateway.insert_advisories(&[]).await.expect("ok"), 0);
        assert_eq!(gateway.insert_air_quality(&[]).await.expect("ok"), 0);
        assert_eq!(gateway.insert_cost_of_living(&[]).await.expect("ok"), 0);
        assert_eq!(client.pings.load(Ordering::SeqCst), 0);
        assert!(client.inserts.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn repeated_inserts_append() {
        let (client, gateway) = gateway();
        let batch = vec![indicator(Some(83.2)), indicator(None)];
        assert_eq!(gateway.insert_indicators(&batch).await.expect("first"), 2);
        assert_eq!(gateway.insert_indicators(&batch).await.expect("second"), 2);

        let inserts = client.inserts.lock().expect("lock");
        assert_eq!(inserts.len(), 2);
        assert_eq!(inserts[0].0, "indicators");
        assert_eq!(inserts[0].1[0]["period"], "2022-01-01");
        assert!(inserts[0].1[1]["value"].is_null());
        assert_eq!(inserts[0].1[0]["meta"], "{}");
    }

    #[tokio::test]
    async fn failed_ping_is_distinguishable_and_skips_insert() {
        let (client, gateway) = gateway();
        client.down.store(true, Ordering::SeqCst);

        let err = gateway
            .insert_indicators(&[indicator(Some(1.0))])
            .await
            .expect_err("down");
        assert!(err.is_unavailable());

        let reading = AirQualityRecord {
            country_iso2: "ES".into(),
            city: "Madrid".into(),
            parameter: AirQualityParameter::No2,
            ts: Utc::now(),
            value: Some(20.0),
            unit: "µg/m³".into(),
            source: "openaq".into(),
        };
        assert!(gateway
            .insert_air_quality(&[reading])
            .await
            .expect_err("down")
            .is_unavailable());
        assert!(client.inserts.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn advisories_skip_the_ping() {
        let (client, gateway) = gateway();
        client.down.store(true, Ordering::SeqCst);
        let advisory = AdvisoryRecord {
            country_iso2: "FR".into(),
            source: "fcdo_uk".into(),
            level: 1,
            headline: "France travel advice".into(),
            url: "https://www.gov.uk/foreign-travel-advice/france".into(),
            published_at: Utc::now(),
            payload: Metadata::new(),
        };
        gateway.insert_advisories(&[advisory]).await.expect("insert");
        assert_eq!(client.pings.load(Ordering::SeqCst), 0);
        assert_eq!(client.inserts.lock().expect("lock")[0].0, "advisories");
    }

    #[tokio::test]
    async fn read_helpers_are_neutral_on_failure() {
        let (client, gateway) = gateway();
        client.fail_queries.store(true, Ordering::SeqCst);
        assert!(gateway
            .last_ingestion_time(Domain::Indicators, "worldbank", Some("de"))
            .await
            .is_none());
        assert!(gateway.latest_advisory("DE").await.is_none());
        assert!(gateway.country_indicator_summary("DE").await.is_empty());
    }

    #[tokio::test]
    async fn last_ingestion_ignores_epoch_placeholder() {
        let (client, gateway) = gateway();
        *client.query_result.lock().expect("lock") =
            vec![json!({ "last_ingestion": "1970-01-01 00:00:00" })];
        assert!(gateway
            .last_ingestion_time(Domain::AirQuality, "openaq", None)
            .await
            .is_none());

        *client.query_result.lock().expect("lock") =
            vec![json!({ "last_ingestion": "2026-02-24 12:00:00" })];
        let ts = gateway
            .last_ingestion_time(Domain::AirQuality, "openaq", None)
            .await
            .expect("timestamp");
        assert_eq!(store_time(&ts), "2026-02-24 12:00:00");
    }
}
