//! OpenAQ v3 air-quality measurements.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use portalis_core::country::resolve_iso2;
use portalis_core::{parse_timestamp, AirQualityParameter, AirQualityRecord};
use portalis_storage::{FetchOptions, HttpFetcher};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{fulfilled, AirQualitySource, ConnectorError};

pub const OPENAQ_BASE_URL: &str = "https://api.openaq.org/v3";
pub const SOURCE: &str = "openaq";
pub const OPENAQ_RETRIES: usize = 2;
const UNKNOWN_CITY: &str = "Unknown";

/// Filter and window for one measurements request.
#[derive(Debug, Clone, PartialEq)]
pub struct AirQualityQuery {
    pub parameter: Option<AirQualityParameter>,
    pub limit: u32,
    pub page: u32,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl Default for AirQualityQuery {
    fn default() -> Self {
        Self {
            parameter: None,
            limit: 1000,
            page: 1,
            date_from: None,
            date_to: None,
        }
    }
}

impl AirQualityQuery {
    /// Measurements from the last `hours_back` hours.
    pub fn recent(parameter: Option<AirQualityParameter>, limit: u32, hours_back: u32) -> Self {
        Self {
            parameter,
            limit,
            date_from: Some(Utc::now() - Duration::hours(i64::from(hours_back))),
            ..Self::default()
        }
    }

    fn pairs(&self, iso2: &str) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("country_id", iso2.to_ascii_uppercase()),
            ("limit", self.limit.to_string()),
            ("page", self.page.to_string()),
        ];
        if let Some(parameter) = self.parameter {
            pairs.push(("parameter", parameter.as_str().to_string()));
        }
        if let Some(from) = self.date_from {
            pairs.push(("date_from", from.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(to) = self.date_to {
            pairs.push(("date_to", to.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        pairs.push(("sort", "desc".to_string()));
        pairs.push(("order_by", "datetime".to_string()));
        pairs
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAqLocation {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(rename = "countryCode", default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAqDate {
    pub utc: String,
    #[serde(default)]
    pub local: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAqMeasurement {
    #[serde(rename = "locationId", default)]
    pub location_id: Option<i64>,
    #[serde(default)]
    pub location: Option<OpenAqLocation>,
    pub parameter: String,
    pub value: Option<f64>,
    pub unit: String,
    pub date: OpenAqDate,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct MeasurementsPage {
    #[serde(default)]
    results: Vec<Value>,
}

#[derive(Debug, Clone)]
pub enum MeasurementShape {
    Strict(OpenAqMeasurement),
    Degraded(Value),
}

impl MeasurementShape {
    pub fn classify(raw: Value) -> Self {
        match OpenAqMeasurement::deserialize(&raw) {
            Ok(m) => Self::Strict(m),
            Err(_) => Self::Degraded(raw),
        }
    }

    pub fn into_record(self, requested_iso2: &str) -> Option<AirQualityRecord> {
        match self {
            Self::Strict(m) => strict_record(m, requested_iso2),
            Self::Degraded(raw) => degraded_record(&raw, requested_iso2),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn strict_record(m: OpenAqMeasurement, requested_iso2: &str) -> Option<AirQualityRecord> {
    let Ok(parameter) = m.parameter.parse::<AirQualityParameter>() else {
        debug!(parameter = %m.parameter, "skipping unsupported parameter");
        return None;
    };
    let ts = parse_timestamp(&m.date.utc)?;
    let location = m.location.as_ref();
    let country_iso2 = resolve_iso2(&[
        location.and_then(|l| non_empty(&l.country_code)),
        non_empty(&m.country),
        Some(requested_iso2),
    ]);
    let city = location
        .and_then(|l| non_empty(&l.city))
        .or_else(|| non_empty(&m.city))
        .or_else(|| location.and_then(|l| non_empty(&l.name)))
        .unwrap_or(UNKNOWN_CITY)
        .to_string();

    Some(AirQualityRecord {
        country_iso2,
        city,
        parameter,
        ts,
        value: m.value,
        unit: m.unit,
        source: SOURCE.to_string(),
    })
}

/// Newer payloads nest the parameter and timestamp differently; pull what we can.
fn degraded_record(raw: &Value, requested_iso2: &str) -> Option<AirQualityRecord> {
    let str_at = |pointer: &str| {
        raw.pointer(pointer)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    };
    let parameter = str_at("/parameter")
        .or_else(|| str_at("/parameter/name"))?
        .parse::<AirQualityParameter>()
        .ok()?;
    let ts = str_at("/date/utc")
        .or_else(|| str_at("/datetime/utc"))
        .or_else(|| str_at("/period/datetimeFrom/utc"))
        .and_then(parse_timestamp)?;
    let unit = str_at("/unit")
        .or_else(|| str_at("/parameter/units"))
        .unwrap_or_default()
        .to_string();

    Some(AirQualityRecord {
        country_iso2: resolve_iso2(&[
            str_at("/location/countryCode"),
            str_at("/country"),
            Some(requested_iso2),
        ]),
        city: str_at("/location/city")
            .or_else(|| str_at("/city"))
            .or_else(|| str_at("/location/name"))
            .unwrap_or(UNKNOWN_CITY)
            .to_string(),
        parameter,
        ts,
        value: raw.get("value").and_then(Value::as_f64),
        unit,
        source: SOURCE.to_string(),
    })
}

pub fn normalize_response(
    body: Value,
    requested_iso2: &str,
) -> Result<Vec<AirQualityRecord>, ConnectorError> {
    let page: MeasurementsPage = serde_json::from_value(body)
        .map_err(|e| ConnectorError::schema(SOURCE, e.to_string()))?;
    let total = page.results.len();
    let records: Vec<_> = page
        .results
        .into_iter()
        .filter_map(|raw| MeasurementShape::classify(raw).into_record(requested_iso2))
        .collect();
    if records.len() < total {
        debug!(
            country = requested_iso2,
            kept = records.len(),
            total,
            "dropped unusable measurements"
        );
    }
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct OpenAqConnector {
    http: HttpFetcher,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAqConnector {
    pub fn new(http: HttpFetcher, api_key: Option<String>) -> Self {
        Self::with_base_url(http, api_key, OPENAQ_BASE_URL)
    }

    pub fn with_base_url(
        http: HttpFetcher,
        api_key: Option<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn measurements_url(&self, iso2: &str, query: &AirQualityQuery) -> Result<String, ConnectorError> {
        let endpoint = format!("{}/measurements", self.base_url);
        Url::parse_with_params(&endpoint, query.pairs(iso2))
            .map(String::from)
            .map_err(|_| ConnectorError::schema(SOURCE, format!("invalid endpoint {endpoint}")))
    }

    fn options(&self) -> FetchOptions {
        let opts = FetchOptions::default().retries(OPENAQ_RETRIES);
        match &self.api_key {
            Some(key) => opts.header("X-API-Key", key.clone()),
            None => opts,
        }
    }

    /// Latest readings across countries over the last day; failed countries are skipped.
    pub async fn fetch_multiple_countries(
        &self,
        countries: &[String],
        parameter: Option<AirQualityParameter>,
        limit: u32,
    ) -> Vec<AirQualityRecord> {
        let query = AirQualityQuery::recent(parameter, limit, 24);
        fulfilled(self.fetch_countries(countries, &query).await)
    }
}

#[async_trait]
impl AirQualitySource for OpenAqConnector {
    async fn fetch_country(
        &self,
        iso2: &str,
        query: &AirQualityQuery,
    ) -> Result<Vec<AirQualityRecord>, ConnectorError> {
        let url = self.measurements_url(iso2, query)?;
        let response = match self.http.fetch_json::<Value>(&url, &self.options()).await {
            Ok(response) => response,
            Err(err) => {
                match err.status() {
                    Some(401) => warn!(
                        country = iso2,
                        "OpenAQ authentication failed; set OPENAQ_API_KEY for access and higher rate limits"
                    ),
                    Some(429) => warn!(country = iso2, "OpenAQ rate limit exceeded"),
                    _ => {}
                }
                return Err(err.into());
            }
        };
        if response.is_not_modified() {
            debug!(country = %iso2, "measurements unchanged since last fetch");
            return Ok(Vec::new());
        }
        let Some(body) = response.data else {
            return Ok(Vec::new());
        };
        let records = normalize_response(body, iso2)?;
        if records.is_empty() {
            info!(country = iso2, "no air quality data available");
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn measurement(location: Value, country: Value, city: Value) -> Value {
        json!({
            "locationId": 7,
            "location": location,
            "parameter": "PM25",
            "value": 12.5,
            "unit": "µg/m³",
            "date": { "utc": "2024-03-01T10:00:00Z", "local": "2024-03-01T11:00:00+01:00" },
            "country": country,
            "city": city
        })
    }

    #[test]
    fn nested_location_wins_over_flat_fields() {
        let body = json!({ "meta": {}, "results": [measurement(
            json!({ "id": 1, "name": "Station A", "country": "Germany", "countryCode": "de", "city": "Berlin" }),
            json!("FR"),
            json!("Paris")
        )] });
        let records = normalize_response(body, "ES").expect("records");
        assert_eq!(records[0].country_iso2, "DE");
        assert_eq!(records[0].city, "Berlin");
        assert_eq!(records[0].parameter, AirQualityParameter::Pm25);
    }

    #[test]
    fn flat_fields_then_requested_country_then_unknown_city() {
        let flat = measurement(Value::Null, json!("FR"), json!("Lyon"));
        let named_only = measurement(json!({ "id": 2, "name": "Station B" }), Value::Null, Value::Null);
        let bare = measurement(Value::Null, Value::Null, Value::Null);
        let records =
            normalize_response(json!({ "results": [flat, named_only, bare] }), "pt").expect("records");

        assert_eq!(records[0].country_iso2, "FR");
        assert_eq!(records[0].city, "Lyon");
        assert_eq!(records[1].country_iso2, "PT");
        assert_eq!(records[1].city, "Station B");
        assert_eq!(records[2].city, UNKNOWN_CITY);
    }

    #[test]
    fn null_values_stay_null_and_unknown_parameters_are_dropped() {
        let mut null_value = measurement(Value::Null, Value::Null, Value::Null);
        null_value["value"] = Value::Null;
        let mut humidity = measurement(Value::Null, Value::Null, Value::Null);
        humidity["parameter"] = json!("relativehumidity");
        let records = normalize_response(json!({ "results": [null_value, humidity] }), "DE")
            .expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, None);
    }

    #[test]
    fn nested_v3_shapes_degrade_gracefully() {
        let raw = json!({
            "value": 31.0,
            "parameter": { "id": 5, "name": "no2", "units": "ppb" },
            "period": { "datetimeFrom": { "utc": "2024-03-01T09:00:00Z" } }
        });
        let records = normalize_response(json!({ "results": [raw] }), "IT").expect("records");
        assert_eq!(records[0].parameter, AirQualityParameter::No2);
        assert_eq!(records[0].unit, "ppb");
        assert_eq!(records[0].country_iso2, "IT");
        assert_eq!(records[0].city, UNKNOWN_CITY);
    }

    #[test]
    fn query_carries_filter_window_and_sort() {
        let http = HttpFetcher::new(Default::default()).expect("fetcher");
        let connector = OpenAqConnector::with_base_url(http, Some("key".into()), "http://localhost:9/v3");
        let mut query = AirQualityQuery::recent(Some(AirQualityParameter::Pm10), 50, 6);
        query.date_from = DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .ok()
            .map(|d| d.with_timezone(&Utc));
        let url = connector.measurements_url("de", &query).expect("url");
        assert_eq!(
            url,
            "http://localhost:9/v3/measurements?country_id=DE&limit=50&page=1&parameter=pm10&date_from=2024-03-01T00%3A00%3A00Z&sort=desc&order_by=datetime"
        );

        let opts = connector.options();
        assert_eq!(opts.retries, Some(OPENAQ_RETRIES));
        assert_eq!(opts.headers, vec![("X-API-Key".to_string(), "key".to_string())]);
    }

    #[test]
    fn blank_api_keys_are_not_sent() {
        let http = HttpFetcher::new(Default::default()).expect("fetcher");
        let connector = OpenAqConnector::new(http, Some("  ".into()));
        assert!(connector.options().headers.is_empty());
    }
}
