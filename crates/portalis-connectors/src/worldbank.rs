//! World Bank indicators API (`api.worldbank.org/v2`).

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use portalis_core::country::{iso3_to_iso2, resolve_iso2};
use portalis_core::{parse_period, IndicatorRecord, Metadata};
use portalis_storage::{FetchOptions, HttpFetcher};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{ConnectorError, IndicatorSource};

pub const WORLD_BANK_BASE_URL: &str = "https://api.worldbank.org/v2";
pub const SOURCE: &str = "worldbank";
const PER_PAGE: u32 = 20_000;

#[derive(Debug, Clone, Deserialize)]
pub struct IdLabel {
    pub id: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorldBankEntry {
    pub indicator: IdLabel,
    pub country: IdLabel,
    #[serde(default)]
    pub countryiso3code: String,
    pub date: String,
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub obs_status: Option<String>,
    #[serde(default)]
    pub decimal: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One data row, either matching the documented shape or kept raw.
#[derive(Debug, Clone)]
pub enum EntryShape {
    Strict(WorldBankEntry),
    Degraded(Value),
}

impl EntryShape {
    pub fn classify(raw: Value) -> Self {
        match WorldBankEntry::deserialize(&raw) {
            Ok(entry) => Self::Strict(entry),
            Err(_) => Self::Degraded(raw),
        }
    }

    pub fn into_record(self, requested_iso2: &str, indicator: &str) -> Option<IndicatorRecord> {
        match self {
            Self::Strict(entry) => strict_record(entry, requested_iso2),
            Self::Degraded(raw) => degraded_record(&raw, requested_iso2, indicator),
        }
    }
}

fn strict_record(entry: WorldBankEntry, requested_iso2: &str) -> Option<IndicatorRecord> {
    let Some(period) = parse_period(&entry.date) else {
        debug!(date = %entry.date, "skipping row with unparseable period");
        return None;
    };
    let country_iso2 = resolve_iso2(&[
        Some(entry.country.id.as_str()),
        iso3_to_iso2(&entry.countryiso3code),
        Some(requested_iso2),
    ]);

    let mut meta = Metadata::new();
    insert_opt(&mut meta, "unit", entry.unit.map(Value::from));
    insert_opt(&mut meta, "obs_status", entry.obs_status.map(Value::from));
    insert_opt(&mut meta, "decimal", entry.decimal.map(Value::from));
    meta.insert("country_name".into(), Value::from(entry.country.value));
    meta.insert("indicator_name".into(), Value::from(entry.indicator.value));
    for (key, value) in entry.extra {
        if !value.is_null() {
            meta.entry(key).or_insert(value);
        }
    }

    Some(IndicatorRecord {
        country_iso2,
        source: SOURCE.to_string(),
        indicator_code: entry.indicator.id,
        period,
        value: entry.value,
        meta,
    })
}

fn degraded_record(raw: &Value, requested_iso2: &str, indicator: &str) -> Option<IndicatorRecord> {
    let period = raw.get("date").and_then(Value::as_str).and_then(parse_period)?;
    let value = raw.get("value").and_then(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    });
    let country_iso2 = resolve_iso2(&[
        raw.pointer("/country/id").and_then(Value::as_str),
        raw.get("countryiso3code")
            .and_then(Value::as_str)
            .and_then(iso3_to_iso2),
        Some(requested_iso2),
    ]);
    let indicator_code = raw
        .pointer("/indicator/id")
        .and_then(Value::as_str)
        .unwrap_or(indicator)
        .to_string();

    let mut meta = Metadata::new();
    meta.insert("degraded".into(), Value::Bool(true));
    insert_opt(
        &mut meta,
        "indicator_name",
        raw.pointer("/indicator/value").cloned(),
    );

    Some(IndicatorRecord {
        country_iso2,
        source: SOURCE.to_string(),
        indicator_code,
        period,
        value,
        meta,
    })
}

fn insert_opt(meta: &mut Metadata, key: &str, value: Option<Value>) {
    if let Some(value) = value.filter(|v| !v.is_null()) {
        meta.insert(key.to_string(), value);
    }
}

/// Normalize a `[page-meta, rows]` response body. A missing or null rows
/// element means "no data"; an error envelope is a schema failure.
pub fn normalize_response(
    body: &Value,
    requested_iso2: &str,
    indicator: &str,
) -> Result<Vec<IndicatorRecord>, ConnectorError> {
    let Some(parts) = body.as_array() else {
        return Err(ConnectorError::schema(SOURCE, "response is not an array"));
    };
    if let Some(message) = parts.first().and_then(|m| m.get("message")) {
        return Err(ConnectorError::schema(SOURCE, message.to_string()));
    }
    let Some(rows) = parts.get(1).and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let total = rows.len();
    let records: Vec<_> = rows
        .iter()
        .cloned()
        .filter_map(|raw| EntryShape::classify(raw).into_record(requested_iso2, indicator))
        .collect();
    if records.len() < total {
        warn!(
            indicator,
            country = requested_iso2,
            kept = records.len(),
            total,
            "dropped malformed indicator rows"
        );
    }
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct WorldBankConnector {
    http: HttpFetcher,
    base_url: String,
}

impl WorldBankConnector {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_base_url(http, WORLD_BANK_BASE_URL)
    }

    pub fn with_base_url(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Query window runs from `since` through next year.
    pub fn indicator_url(&self, indicator: &str, iso2: &str, since: i32) -> String {
        let until = Utc::now().year() + 1;
        format!(
            "{}/country/{iso2}/indicator/{indicator}?format=json&per_page={PER_PAGE}&date={since}:{until}",
            self.base_url
        )
    }
}

#[async_trait]
impl IndicatorSource for WorldBankConnector {
    async fn fetch_indicator(
        &self,
        indicator: &str,
        iso2: &str,
        since: i32,
    ) -> Result<Vec<IndicatorRecord>, ConnectorError> {
        let url = self.indicator_url(indicator, iso2, since);
        let response = self
            .http
            .fetch_json::<Value>(&url, &FetchOptions::default())
            .await?;
        if response.is_not_modified() {
            debug!(indicator, iso2, "indicator unchanged since last fetch");
            return Ok(Vec::new());
        }
        let Some(body) = response.data else {
            return Ok(Vec::new());
        };

        let records = normalize_response(&body, iso2, indicator)?;
        if records.is_empty() {
            info!(indicator, country = iso2, "no indicator data available");
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn row(date: &str, value: Value) -> Value {
        json!({
            "indicator": { "id": "SP.POP.TOTL", "value": "Population, total" },
            "country": { "id": "DE", "value": "Germany" },
            "countryiso3code": "DEU",
            "date": date,
            "value": value,
            "unit": "",
            "obs_status": "",
            "decimal": 0
        })
    }

    #[test]
    fn normalizes_rows_and_keeps_null_values() {
        let body = json!([
            { "page": 1, "pages": 1, "per_page": 20000, "total": 2 },
            [row("2022", json!(83_800_000.0)), row("2021", Value::Null)]
        ]);
        let records = normalize_response(&body, "DE", "SP.POP.TOTL").expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].country_iso2, "DE");
        assert_eq!(records[0].period, NaiveDate::from_ymd_opt(2022, 1, 1).expect("date"));
        assert_eq!(records[0].value, Some(83_800_000.0));
        assert_eq!(records[1].value, None);
        assert_eq!(records[0].meta["indicator_name"], "Population, total");
        assert_eq!(records[0].source, SOURCE);
    }

    #[test]
    fn missing_rows_mean_no_data() {
        let body = json!([{ "page": 0, "pages": 0, "per_page": 20000, "total": 0 }, null]);
        assert!(normalize_response(&body, "DE", "SP.POP.TOTL")
            .expect("empty")
            .is_empty());
        let body = json!([{ "page": 0, "pages": 0, "per_page": 20000, "total": 0 }]);
        assert!(normalize_response(&body, "DE", "SP.POP.TOTL")
            .expect("empty")
            .is_empty());
    }

    #[test]
    fn error_envelopes_are_schema_failures() {
        let body = json!([{ "message": [{ "id": "120", "key": "Invalid value" }] }]);
        assert!(matches!(
            normalize_response(&body, "DE", "XX.BAD"),
            Err(ConnectorError::Schema { .. })
        ));
        assert!(normalize_response(&json!({ "oops": true }), "DE", "XX.BAD").is_err());
    }

    #[test]
    fn malformed_rows_degrade_instead_of_failing_the_batch() {
        let body = json!([
            { "page": 1 },
            [
                row("2020Q2", json!(1.5)),
                { "date": "2019", "value": "2.25", "countryiso3code": "ESP" },
                { "value": 3.0 }
            ]
        ]);
        let records = normalize_response(&body, "ES", "FP.CPI.TOTL.ZG").expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].period, NaiveDate::from_ymd_opt(2020, 4, 1).expect("date"));
        assert_eq!(records[1].country_iso2, "ES");
        assert_eq!(records[1].indicator_code, "FP.CPI.TOTL.ZG");
        assert_eq!(records[1].value, Some(2.25));
        assert_eq!(records[1].meta["degraded"], true);
    }

    #[test]
    fn explicit_country_field_wins_over_requested_code() {
        let mut raw = row("2022", json!(1.0));
        raw["country"]["id"] = json!("");
        let body = json!([{}, [raw]]);
        let records = normalize_response(&body, "FR", "SP.POP.TOTL").expect("records");
        assert_eq!(records[0].country_iso2, "DE");
    }

    #[test]
    fn unknown_fields_are_preserved_in_meta() {
        let mut raw = row("2022", json!(1.0));
        raw["footnote"] = json!("provisional");
        let body = json!([{}, [raw]]);
        let records = normalize_response(&body, "DE", "SP.POP.TOTL").expect("records");
        assert_eq!(records[0].meta["footnote"], "provisional");
    }

    #[test]
    fn indicator_url_covers_since_through_next_year() {
        let http = HttpFetcher::new(Default::default()).expect("fetcher");
        let connector = WorldBankConnector::with_base_url(http, "http://localhost:9/v2/");
        let url = connector.indicator_url("NY.GDP.PCAP.KD", "DE", 2015);
        let until = Utc::now().year() + 1;
        assert_eq!(
            url,
            format!(
                "http://localhost:9/v2/country/DE/indicator/NY.GDP.PCAP.KD?format=json&per_page=20000&date=2015:{until}"
            )
        );
    }
}
