//! US State Department travel advisories (`cadataapi.state.gov`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use portalis_core::country::{country_name_to_iso2, resolve_iso2};
use portalis_core::{parse_timestamp, AdvisoryRecord, Metadata};
use portalis_storage::{FetchOptions, HttpFetcher};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{ConnectorError, UsAdvisorySource};

pub const STATE_DEPT_URL: &str = "https://cadataapi.state.gov/api/TravelAdvisories";
pub const SOURCE: &str = "us_state_dept";

static LEVEL_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)level\s*(\d+)").expect("level pattern is valid"));

/// Keyword fallbacks, most severe first.
const LEVEL_KEYWORDS: [(&str, u8); 4] = [
    ("do not travel", 4),
    ("reconsider", 3),
    ("increased caution", 2),
    ("normal precautions", 1),
];

/// Advisory level from a label such as `Level 2: Exercise Increased Caution`.
/// Returns 0 when neither an explicit level nor a known phrase is present.
pub fn parse_advisory_level(label: &str) -> u8 {
    if let Some(level) = LEVEL_LABEL
        .captures(label)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .filter(|n| (1..=4).contains(n))
    {
        return level;
    }
    let lower = label.to_lowercase();
    LEVEL_KEYWORDS
        .iter()
        .find(|(phrase, _)| lower.contains(phrase))
        .map(|(_, level)| *level)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TravelAdvisory {
    #[serde(default)]
    pub country_code: Option<String>,
    pub country_name: String,
    pub travel_advisory_level: String,
    #[serde(default)]
    pub travel_advisory_headline_text: Option<String>,
    #[serde(rename = "TravelAdvisoryURL", default)]
    pub travel_advisory_url: Option<String>,
    #[serde(default)]
    pub notified_date: Option<String>,
    #[serde(default)]
    pub last_updated_date: Option<String>,
    #[serde(default)]
    pub travel_advisory_text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Wrapped { data: Vec<Value> },
    Bare(Vec<Value>),
}

#[derive(Debug, Clone)]
pub enum AdvisoryShape {
    Strict(TravelAdvisory),
    Degraded(Value),
}

impl AdvisoryShape {
    pub fn classify(raw: Value) -> Self {
        match TravelAdvisory::deserialize(&raw) {
            Ok(advisory) => Self::Strict(advisory),
            Err(_) => Self::Degraded(raw),
        }
    }

    pub fn into_record(self, now: DateTime<Utc>) -> Option<AdvisoryRecord> {
        match self {
            Self::Strict(advisory) => Some(strict_record(advisory, now)),
            Self::Degraded(raw) => degraded_record(&raw, now),
        }
    }
}

fn first_timestamp(candidates: &[Option<&str>]) -> Option<DateTime<Utc>> {
    candidates.iter().flatten().find_map(|raw| parse_timestamp(raw))
}

fn opt_value(value: Option<String>) -> Value {
    value.map(Value::from).unwrap_or(Value::Null)
}

fn strict_record(a: TravelAdvisory, now: DateTime<Utc>) -> AdvisoryRecord {
    let name_guess = country_name_to_iso2(&a.country_name);
    let country_iso2 = resolve_iso2(&[a.country_code.as_deref(), Some(name_guess.as_str())]);
    let level = parse_advisory_level(&a.travel_advisory_level);
    let published_at = first_timestamp(&[a.notified_date.as_deref(), a.last_updated_date.as_deref()])
        .unwrap_or(now);
    let headline = a
        .travel_advisory_headline_text
        .clone()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| a.travel_advisory_level.clone());

    let mut payload = Metadata::new();
    payload.insert("country_name".into(), Value::from(a.country_name));
    payload.insert("level_text".into(), Value::from(a.travel_advisory_level));
    payload.insert("advisory_text".into(), opt_value(a.travel_advisory_text));
    payload.insert("last_updated".into(), opt_value(a.last_updated_date));
    payload.insert("notified_date".into(), opt_value(a.notified_date));
    for (key, value) in a.extra {
        payload.entry(key).or_insert(value);
    }

    AdvisoryRecord {
        country_iso2,
        source: SOURCE.to_string(),
        level,
        headline,
        url: a.travel_advisory_url.unwrap_or_default(),
        published_at,
        payload,
    }
}

fn degraded_record(raw: &Value, now: DateTime<Utc>) -> Option<AdvisoryRecord> {
    let text = |key: &str| raw.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty());
    let code = text("CountryCode");
    let name = text("CountryName");
    if code.is_none() && name.is_none() {
        return None;
    }
    let name_guess = name.map(country_name_to_iso2);
    let level_text = text("TravelAdvisoryLevel").or(text("Title")).unwrap_or_default();

    let mut payload = Metadata::new();
    payload.insert("degraded".into(), Value::Bool(true));
    payload.insert("raw".into(), raw.clone());

    Some(AdvisoryRecord {
        country_iso2: resolve_iso2(&[code, name_guess.as_deref()]),
        source: SOURCE.to_string(),
        level: parse_advisory_level(level_text),
        headline: text("TravelAdvisoryHeadlineText")
            .unwrap_or(level_text)
            .to_string(),
        url: text("TravelAdvisoryURL").unwrap_or_default().to_string(),
        published_at: first_timestamp(&[text("NotifiedDate"), text("LastUpdatedDate")])
            .unwrap_or(now),
        payload,
    })
}

/// Accepts both `{ "data": [...] }` and a bare array.
pub fn normalize_response(body: Value) -> Result<Vec<AdvisoryRecord>, ConnectorError> {
    let entries = match serde_json::from_value::<Envelope>(body) {
        Ok(Envelope::Wrapped { data }) | Ok(Envelope::Bare(data)) => data,
        Err(err) => return Err(ConnectorError::schema(SOURCE, err.to_string())),
    };
    let total = entries.len();
    let now = Utc::now();
    let records: Vec<_> = entries
        .into_iter()
        .filter_map(|raw| AdvisoryShape::classify(raw).into_record(now))
        .collect();
    if records.len() < total {
        warn!(kept = records.len(), total, "dropped unidentifiable advisories");
    }
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct StateDeptConnector {
    http: HttpFetcher,
    url: String,
}

impl StateDeptConnector {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_url(http, STATE_DEPT_URL)
    }

    pub fn with_url(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub async fn fetch_us_advisory(
        &self,
        iso2: &str,
    ) -> Result<Option<AdvisoryRecord>, ConnectorError> {
        let wanted = iso2.to_ascii_uppercase();
        Ok(self
            .fetch_us_advisories()
            .await?
            .into_iter()
            .find(|a| a.country_iso2 == wanted))
    }
}

#[async_trait]
impl UsAdvisorySource for StateDeptConnector {
    async fn fetch_us_advisories(&self) -> Result<Vec<AdvisoryRecord>, ConnectorError> {
        let response = self
            .http
            .fetch_json::<Value>(&self.url, &FetchOptions::default())
            .await?;
        if response.is_not_modified() {
            info!("advisory feed unchanged since last fetch");
            return Ok(Vec::new());
        }
        let Some(body) = response.data else {
            return Ok(Vec::new());
        };
        let records = normalize_response(body)?;
        if records.is_empty() {
            info!("no travel advisories available from the US State Department");
        }
        Ok(records)
    }
}
