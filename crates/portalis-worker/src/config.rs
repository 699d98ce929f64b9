use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use portalis_core::country::{normalize_iso2, DEFAULT_MONITOR_COUNTRIES};
use portalis_storage::{BackoffPolicy, ClickHouseConfig, HttpClientConfig};
use tracing::warn;

use crate::processors::ProcessorSettings;
use crate::queue::QueuePolicy;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unset means the in-process queue.
    pub queue_database_url: Option<String>,
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    pub clickhouse_username: Option<String>,
    pub clickhouse_password: Option<String>,
    pub openaq_api_key: Option<String>,
    pub numbeo_api_key: Option<String>,
    pub trading_economics_key: Option<String>,
    pub indicators_interval: Duration,
    pub advisories_interval: Duration,
    pub air_quality_interval: Duration,
    pub countries: Vec<String>,
    pub fallback_dir: PathBuf,
    pub http_timeout: Duration,
    pub http_retries: usize,
    pub concurrency: usize,
    pub health_interval: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
    pub indicator_delay: Duration,
    pub advisory_delay: Duration,
    pub air_quality_delay: Duration,
    pub synthetic_advisories_on_tls_failure: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl WorkerConfig {
    /// Reads the process environment as it stands. The binary loads `.env`
    /// once at startup, before this is called.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let millis = |key: &str, default: u64| Duration::from_millis(parsed(&text, key, default));
        let secs = |key: &str, default: u64| Duration::from_secs(parsed(&text, key, default));

        Self {
            queue_database_url: text("QUEUE_DATABASE_URL").or_else(|| text("DATABASE_URL")),
            clickhouse_url: text("CLICKHOUSE_HTTP")
                .unwrap_or_else(|| "http://localhost:8123".to_string()),
            clickhouse_database: text("CLICKHOUSE_DATABASE")
                .unwrap_or_else(|| "portalis".to_string()),
            clickhouse_username: text("CLICKHOUSE_USERNAME"),
            clickhouse_password: text("CLICKHOUSE_PASSWORD"),
            openaq_api_key: text("OPENAQ_API_KEY"),
            numbeo_api_key: text("NUMBEO_API_KEY"),
            trading_economics_key: text("TRADING_ECONOMICS_KEY"),
            indicators_interval: millis("INDICATORS_INTERVAL", 24 * 60 * 60 * 1000),
            advisories_interval: millis("ADVISORIES_INTERVAL", 6 * 60 * 60 * 1000),
            air_quality_interval: millis("AIR_QUALITY_INTERVAL", 12 * 60 * 60 * 1000),
            countries: text("MONITOR_COUNTRIES")
                .map(|raw| parse_countries(&raw))
                .filter(|list| !list.is_empty())
                .unwrap_or_else(|| DEFAULT_MONITOR_COUNTRIES.iter().map(|c| c.to_string()).collect()),
            fallback_dir: text("FALLBACK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/fallback")),
            http_timeout: millis("HTTP_TIMEOUT_MS", 30_000),
            http_retries: parsed(&text, "HTTP_RETRIES", 3),
            concurrency: parsed(&text, "WORKER_CONCURRENCY", 1usize).max(1),
            health_interval: secs("HEALTH_INTERVAL_SECS", 300),
            stalled_interval: secs("STALLED_INTERVAL_SECS", 30),
            max_stalled_count: parsed(&text, "MAX_STALLED_COUNT", 1),
            indicator_delay: millis("INDICATOR_DELAY_MS", 500),
            advisory_delay: millis("ADVISORY_DELAY_MS", 1000),
            air_quality_delay: millis("AIR_QUALITY_DELAY_MS", 2000),
            synthetic_advisories_on_tls_failure: text("SYNTHETIC_ADVISORIES_ON_TLS_FAILURE")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
        }
    }

    /// One line per optional API key that is missing.
    pub fn api_key_warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.openaq_api_key.is_none() {
            warnings.push("OPENAQ_API_KEY not set - air quality collection is disabled or rate limited");
        }
        if self.numbeo_api_key.is_none() {
            warnings.push("NUMBEO_API_KEY not set - cost of living data may be limited");
        }
        if self.trading_economics_key.is_none() {
            warnings.push("TRADING_ECONOMICS_KEY not set - economic data may be limited");
        }
        warnings
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            backoff: BackoffPolicy {
                max_retries: self.http_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        }
    }

    pub fn clickhouse(&self) -> ClickHouseConfig {
        let mut config = ClickHouseConfig::new(&self.clickhouse_url, &self.clickhouse_database);
        config.username = self.clickhouse_username.clone();
        config.password = self.clickhouse_password.clone();
        config
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            indicator_delay: self.indicator_delay,
            advisory_delay: self.advisory_delay,
            air_quality_delay: self.air_quality_delay,
            synthetic_advisories_on_tls_failure: self.synthetic_advisories_on_tls_failure,
        }
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            max_stalled_count: self.max_stalled_count,
            ..QueuePolicy::default()
        }
    }
}

fn parsed<T: FromStr + Copy>(text: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match text(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring malformed setting, using default");
            default
        }),
    }
}

fn parse_countries(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|code| {
            let normalized = normalize_iso2(code);
            if normalized.is_none() && !code.trim().is_empty() {
                warn!(code = code.trim(), "ignoring invalid country code in MONITOR_COUNTRIES");
            }
            normalized
        })
        .collect()
}
