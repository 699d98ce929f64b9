//! Job specifications, preset factories, and per-run outcome summaries.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::country::FCDO_EU_SLUGS;
use crate::AirQualityParameter;

/// World Bank indicator codes used by the presets.
pub mod indicators {
    pub const GDP_PER_CAPITA: &str = "NY.GDP.PCAP.KD";
    pub const GDP_GROWTH: &str = "NY.GDP.MKTP.KD.ZG";
    pub const INFLATION: &str = "FP.CPI.TOTL.ZG";
    pub const UNEMPLOYMENT: &str = "SL.UEM.TOTL.ZS";
    pub const LIFE_EXPECTANCY: &str = "SP.DYN.LE00.IN";
    pub const POPULATION: &str = "SP.POP.TOTL";
    pub const URBAN_POPULATION: &str = "SP.URB.TOTL.IN.ZS";
    pub const LITERACY_RATE: &str = "SE.ADT.LITR.ZS";
    pub const CO2_EMISSIONS: &str = "EN.ATM.CO2E.PC";
    pub const FOREST_AREA: &str = "AG.LND.FRST.ZS";
    pub const RENEWABLE_ENERGY: &str = "EG.FEC.RNEW.ZS";
    pub const INTERNET_USERS: &str = "IT.NET.USER.ZS";
    pub const MOBILE_SUBSCRIPTIONS: &str = "IT.CEL.SETS.P2";

    pub const COMMON: [&str; 13] = [
        GDP_PER_CAPITA,
        GDP_GROWTH,
        INFLATION,
        UNEMPLOYMENT,
        LIFE_EXPECTANCY,
        POPULATION,
        URBAN_POPULATION,
        LITERACY_RATE,
        CO2_EMISSIONS,
        FOREST_AREA,
        RENEWABLE_ENERGY,
        INTERNET_USERS,
        MOBILE_SUBSCRIPTIONS,
    ];
}

pub const DEFAULT_SINCE_YEAR: i32 = 2015;
pub const DEFAULT_AIR_QUALITY_LIMIT: u32 = 100;
pub const DEFAULT_HOURS_BACK: u32 = 24;
pub const DEFAULT_AIR_QUALITY_PARAMETERS: [AirQualityParameter; 4] = [
    AirQualityParameter::Pm25,
    AirQualityParameter::Pm10,
    AirQualityParameter::O3,
    AirQualityParameter::No2,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Indicators,
    Advisories,
    AirQuality,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [Self::Indicators, Self::Advisories, Self::AirQuality];

    /// Name jobs of this kind carry on the queue.
    pub const fn queue_name(self) -> &'static str {
        match self {
            Self::Indicators => "worldbank.indicators",
            Self::Advisories => "advisories",
            Self::AirQuality => "airquality",
        }
    }

    /// Stable id of the recurring definition for this kind.
    pub const fn recurring_id(self) -> &'static str {
        match self {
            Self::Indicators => "worldbank-indicators-daily",
            Self::Advisories => "advisories-6hourly",
            Self::AirQuality => "airquality-12hourly",
        }
    }

    pub fn from_queue_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.queue_name() == name)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorJobData {
    pub indicators: Vec<String>,
    pub countries: Vec<String>,
    #[serde(default = "default_since")]
    pub since: i32,
}

fn default_since() -> i32 {
    DEFAULT_SINCE_YEAR
}

impl IndicatorJobData {
    pub fn new(countries: &[String], indicators: &[&str], since: i32) -> Self {
        Self {
            indicators: indicators.iter().map(|s| s.to_string()).collect(),
            countries: countries.to_vec(),
            since,
        }
    }

    pub fn economic(countries: &[String]) -> Self {
        use indicators::*;
        Self::new(
            countries,
            &[GDP_PER_CAPITA, GDP_GROWTH, INFLATION, UNEMPLOYMENT],
            DEFAULT_SINCE_YEAR,
        )
    }

    pub fn social(countries: &[String]) -> Self {
        use indicators::*;
        Self::new(
            countries,
            &[LIFE_EXPECTANCY, POPULATION, URBAN_POPULATION, LITERACY_RATE],
            DEFAULT_SINCE_YEAR,
        )
    }

    pub fn environmental(countries: &[String]) -> Self {
        use indicators::*;
        Self::new(
            countries,
            &[CO2_EMISSIONS, FOREST_AREA, RENEWABLE_ENERGY],
            DEFAULT_SINCE_YEAR,
        )
    }

    pub fn infrastructure(countries: &[String]) -> Self {
        use indicators::*;
        Self::new(
            countries,
            &[INTERNET_USERS, MOBILE_SUBSCRIPTIONS],
            DEFAULT_SINCE_YEAR,
        )
    }

    pub fn full_profile(countries: &[String]) -> Self {
        Self::new(countries, &indicators::COMMON, DEFAULT_SINCE_YEAR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisorySource {
    UsStateDept,
    FcdoUk,
}

impl AdvisorySource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UsStateDept => "us_state_dept",
            Self::FcdoUk => "fcdo_uk",
        }
    }
}

impl fmt::Display for AdvisorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryJobData {
    pub sources: Vec<AdvisorySource>,
    /// UK path slugs; `None` means the EU slug list.
    #[serde(default)]
    pub countries: Option<Vec<String>>,
}

impl AdvisoryJobData {
    pub fn new(sources: &[AdvisorySource], countries: Option<Vec<String>>) -> Self {
        Self {
            sources: sources.to_vec(),
            countries,
        }
    }

    pub fn all() -> Self {
        Self::new(&[AdvisorySource::UsStateDept, AdvisorySource::FcdoUk], None)
    }

    pub fn us_only() -> Self {
        Self::new(&[AdvisorySource::UsStateDept], None)
    }

    pub fn fcdo_eu() -> Self {
        Self::new(
            &[AdvisorySource::FcdoUk],
            Some(FCDO_EU_SLUGS.iter().map(|s| s.to_string()).collect()),
        )
    }

    pub fn fcdo_custom(slugs: &[String]) -> Self {
        Self::new(&[AdvisorySource::FcdoUk], Some(slugs.to_vec()))
    }

    pub fn uk_slugs(&self) -> Vec<String> {
        self.countries
            .clone()
            .unwrap_or_else(|| FCDO_EU_SLUGS.iter().map(|s| s.to_string()).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQualityJobData {
    pub countries: Vec<String>,
    #[serde(default)]
    pub parameters: Option<Vec<AirQualityParameter>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub hours_back: Option<u32>,
}

impl AirQualityJobData {
    pub fn new(
        countries: &[String],
        parameters: &[AirQualityParameter],
        limit: u32,
        hours_back: u32,
    ) -> Self {
        Self {
            countries: countries.to_vec(),
            parameters: Some(parameters.to_vec()),
            limit: Some(limit),
            hours_back: Some(hours_back),
        }
    }

    pub fn essential(countries: &[String]) -> Self {
        use AirQualityParameter::*;
        Self::new(countries, &[Pm25, Pm10, No2], 200, 24)
    }

    pub fn comprehensive(countries: &[String]) -> Self {
        use AirQualityParameter::*;
        Self::new(countries, &[Pm25, Pm10, O3, No2, So2, Co], 500, 48)
    }

    pub fn pm25_only(countries: &[String]) -> Self {
        Self::new(countries, &[AirQualityParameter::Pm25], 300, 24)
    }

    pub fn recent(countries: &[String]) -> Self {
        use AirQualityParameter::*;
        Self::new(countries, &[Pm25, Pm10, No2], 100, 6)
    }

    pub fn effective_parameters(&self) -> Vec<AirQualityParameter> {
        self.parameters
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_AIR_QUALITY_PARAMETERS.to_vec())
    }

    /// The job limit split evenly across parameters, never below one.
    pub fn limit_per_parameter(&self) -> u32 {
        let params = self.effective_parameters().len().max(1) as u32;
        (self.limit.unwrap_or(DEFAULT_AIR_QUALITY_LIMIT) / params).max(1)
    }

    pub fn effective_hours_back(&self) -> u32 {
        self.hours_back.unwrap_or(DEFAULT_HOURS_BACK)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum JobSpecError {
    #[error("unknown job type `{0}`")]
    UnknownJobType(String),
    #[error("malformed data for job `{name}`: {message}")]
    Malformed { name: String, message: String },
    #[error("invalid job `{name}`: {message}")]
    Invalid { name: String, message: String },
}

/// The immutable scope of one job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobSpec {
    Indicators(IndicatorJobData),
    Advisories(AdvisoryJobData),
    AirQuality(AirQualityJobData),
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Indicators(_) => JobKind::Indicators,
            Self::Advisories(_) => JobKind::Advisories,
            Self::AirQuality(_) => JobKind::AirQuality,
        }
    }

    /// JSON payload stored on the queue alongside [`JobKind::queue_name`].
    pub fn payload(&self) -> Value {
        let encoded = match self {
            Self::Indicators(d) => serde_json::to_value(d),
            Self::Advisories(d) => serde_json::to_value(d),
            Self::AirQuality(d) => serde_json::to_value(d),
        };
        encoded.unwrap_or(Value::Null)
    }

    /// Rebuild a spec from a queue name and payload, rejecting unknown names,
    /// undecodable payloads, and specs with nothing to do.
    pub fn decode(name: &str, data: &Value) -> Result<Self, JobSpecError> {
        let kind = JobKind::from_queue_name(name)
            .ok_or_else(|| JobSpecError::UnknownJobType(name.to_string()))?;
        let malformed = |e: serde_json::Error| JobSpecError::Malformed {
            name: name.to_string(),
            message: e.to_string(),
        };
        let spec = match kind {
            JobKind::Indicators => {
                Self::Indicators(serde_json::from_value(data.clone()).map_err(malformed)?)
            }
            JobKind::Advisories => {
                Self::Advisories(serde_json::from_value(data.clone()).map_err(malformed)?)
            }
            JobKind::AirQuality => {
                Self::AirQuality(serde_json::from_value(data.clone()).map_err(malformed)?)
            }
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), JobSpecError> {
        let invalid = |message: &str| {
            Err(JobSpecError::Invalid {
                name: self.kind().queue_name().to_string(),
                message: message.to_string(),
            })
        };
        match self {
            Self::Indicators(d) if d.countries.is_empty() => invalid("no countries"),
            Self::Indicators(d) if d.indicators.is_empty() => invalid("no indicator codes"),
            Self::Advisories(d) if d.sources.is_empty() => invalid("no advisory sources"),
            Self::AirQuality(d) if d.countries.is_empty() => invalid("no countries"),
            _ => Ok(()),
        }
    }

    /// Look up a named preset; country-less presets ignore `countries`.
    pub fn preset(kind: JobKind, name: &str, countries: &[String]) -> Option<Self> {
        let spec = match (kind, name) {
            (JobKind::Indicators, "economic") => Self::Indicators(IndicatorJobData::economic(countries)),
            (JobKind::Indicators, "social") => Self::Indicators(IndicatorJobData::social(countries)),
            (JobKind::Indicators, "environmental") => {
                Self::Indicators(IndicatorJobData::environmental(countries))
            }
            (JobKind::Indicators, "infrastructure") => {
                Self::Indicators(IndicatorJobData::infrastructure(countries))
            }
            (JobKind::Indicators, "full_profile") => {
                Self::Indicators(IndicatorJobData::full_profile(countries))
            }
            (JobKind::Advisories, "all") => Self::Advisories(AdvisoryJobData::all()),
            (JobKind::Advisories, "us_only") => Self::Advisories(AdvisoryJobData::us_only()),
            (JobKind::Advisories, "fcdo_eu") => Self::Advisories(AdvisoryJobData::fcdo_eu()),
            (JobKind::Advisories, "fcdo_custom") => {
                Self::Advisories(AdvisoryJobData::fcdo_custom(countries))
            }
            (JobKind::AirQuality, "essential") => {
                Self::AirQuality(AirQualityJobData::essential(countries))
            }
            (JobKind::AirQuality, "comprehensive") => {
                Self::AirQuality(AirQualityJobData::comprehensive(countries))
            }
            (JobKind::AirQuality, "pm25_only") => {
                Self::AirQuality(AirQualityJobData::pm25_only(countries))
            }
            (JobKind::AirQuality, "recent") => Self::AirQuality(AirQualityJobData::recent(countries)),
            _ => return None,
        };
        Some(spec)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTally {
    pub processed: usize,
    pub errors: usize,
    pub fallback: usize,
}

/// Per-run summary used for logging and queue bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub kind: JobKind,
    pub total_processed: usize,
    pub total_errors: usize,
    pub fallback_records: usize,
    pub breakdown: BTreeMap<String, UnitTally>,
}

impl JobOutcome {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            total_processed: 0,
            total_errors: 0,
            fallback_records: 0,
            breakdown: BTreeMap::new(),
        }
    }

    pub fn record_written(&mut self, unit: &str, records: usize) {
        self.total_processed += records;
        self.breakdown.entry(unit.to_string()).or_default().processed += records;
    }

    /// Records diverted to the fallback store still count as processed.
    pub fn record_fallback(&mut self, unit: &str, records: usize) {
        self.total_processed += records;
        self.fallback_records += records;
        let tally = self.breakdown.entry(unit.to_string()).or_default();
        tally.processed += records;
        tally.fallback += records;
    }

    pub fn record_error(&mut self, unit: &str) {
        self.total_errors += 1;
        self.breakdown.entry(unit.to_string()).or_default().errors += 1;
    }
}
