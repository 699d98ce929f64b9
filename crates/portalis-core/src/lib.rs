//! Normalized record model and job specifications for the Portalis ingestion worker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod country;
pub mod jobs;

pub use jobs::{
    AdvisoryJobData, AdvisorySource, AirQualityJobData, IndicatorJobData, JobKind, JobOutcome,
    JobSpec, JobSpecError, UnitTally,
};

pub const CRATE_NAME: &str = "portalis-core";

/// Open side-channel map carried by records for source-specific detail.
pub type Metadata = Map<String, Value>;

/// One observation of an economic indicator for a country and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub country_iso2: String,
    pub source: String,
    pub indicator_code: String,
    pub period: NaiveDate,
    pub value: Option<f64>,
    #[serde(default)]
    pub meta: Metadata,
}

/// A travel advisory issued by one government source for one country.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryRecord {
    pub country_iso2: String,
    pub source: String,
    /// 0 = unknown, 1..=4 = increasing severity.
    pub level: u8,
    pub headline: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Metadata,
}

impl AdvisoryRecord {
    /// True when the record was substituted locally instead of fetched upstream.
    pub fn is_synthetic(&self) -> bool {
        self.payload
            .get("synthetic")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQualityRecord {
    pub country_iso2: String,
    pub city: String,
    pub parameter: AirQualityParameter,
    pub ts: DateTime<Utc>,
    pub value: Option<f64>,
    pub unit: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostOfLivingRecord {
    pub country_iso2: String,
    pub city: String,
    pub category: String,
    pub item: String,
    pub value: Option<f64>,
    pub currency: String,
    pub period: NaiveDate,
    pub source: String,
}

/// Pollutants the air-quality domain accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AirQualityParameter {
    Pm25,
    Pm10,
    O3,
    No2,
    So2,
    Co,
    Bc,
}

impl AirQualityParameter {
    pub const ALL: [AirQualityParameter; 7] = [
        Self::Pm25,
        Self::Pm10,
        Self::O3,
        Self::No2,
        Self::So2,
        Self::Co,
        Self::Bc,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pm25 => "pm25",
            Self::Pm10 => "pm10",
            Self::O3 => "o3",
            Self::No2 => "no2",
            Self::So2 => "so2",
            Self::Co => "co",
            Self::Bc => "bc",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Pm25 => "PM2.5",
            Self::Pm10 => "PM10",
            Self::O3 => "Ozone",
            Self::No2 => "NO2",
            Self::So2 => "SO2",
            Self::Co => "CO",
            Self::Bc => "Black Carbon",
        }
    }
}

impl fmt::Display for AirQualityParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown air quality parameter `{0}`")]
pub struct UnknownParameter(pub String);

impl FromStr for AirQualityParameter {
    type Err = UnknownParameter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['.', '_'], "");
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| UnknownParameter(s.to_string()))
    }
}

/// Record families the analytical store keeps in separate tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Indicators,
    Advisories,
    AirQuality,
    CostOfLiving,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Self::Indicators,
        Self::Advisories,
        Self::AirQuality,
        Self::CostOfLiving,
    ];

    pub const fn table(self) -> &'static str {
        match self {
            Self::Indicators => "indicators",
            Self::Advisories => "advisories",
            Self::AirQuality => "air_quality",
            Self::CostOfLiving => "cost_of_living",
        }
    }

    /// Short name used in fallback blob paths.
    pub const fn slug(self) -> &'static str {
        match self {
            Self::Indicators => "indicators",
            Self::Advisories => "advisories",
            Self::AirQuality => "airquality",
            Self::CostOfLiving => "cost_of_living",
        }
    }

    pub fn from_slug(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.slug() == s || d.table() == s)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Parse the timestamp shapes upstream APIs emit into UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
        }
    }
    None
}

/// Map an indicator period label (`2020`, `2020M07`, `2020Q3`) to the first day it covers.
pub fn parse_period(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let year: i32 = raw.get(..4)?.parse().ok()?;
    let rest = &raw[4..];
    let month = match rest.chars().next() {
        None => 1,
        Some('M') | Some('m') => rest[1..].parse::<u32>().ok().filter(|m| (1..=12).contains(m))?,
        Some('Q') | Some('q') => {
            let quarter = rest[1..].parse::<u32>().ok().filter(|q| (1..=4).contains(q))?;
            (quarter - 1) * 3 + 1
        }
        Some(_) => return None,
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}
