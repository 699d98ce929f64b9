//! UK FCDO foreign travel advice via the GOV.UK content API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portalis_core::country::slug_to_iso2;
use portalis_core::{parse_timestamp, AdvisoryRecord, Metadata};
use portalis_storage::{FetchOptions, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{ConnectorError, UkAdvisorySource};

pub const FCDO_CONTENT_URL: &str = "https://www.gov.uk/api/content/foreign-travel-advice";
pub const FCDO_PUBLIC_URL: &str = "https://www.gov.uk/foreign-travel-advice";
pub const SOURCE: &str = "fcdo_uk";

/// Ordered rules over title and description; the first match wins.
const LEVEL_RULES: [(&[&str], u8); 3] = [
    (&["do not travel", "avoid all travel"], 4),
    (&["avoid all but essential travel", "reconsider"], 3),
    (&["see our travel advice", "check latest"], 2),
];

pub fn parse_fcdo_level(title: &str, description: Option<&str>) -> u8 {
    let text = format!("{title} {}", description.unwrap_or_default()).to_lowercase();
    LEVEL_RULES
        .iter()
        .find(|(phrases, _)| phrases.iter().any(|p| text.contains(p)))
        .map(|(_, level)| *level)
        .unwrap_or(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNote {
    pub note: String,
    pub public_timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcdoDetails {
    #[serde(default)]
    pub reviewed_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub change_history: Option<Vec<ChangeNote>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FcdoContent {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub public_updated_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub details: Option<FcdoDetails>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub enum ContentShape {
    Strict(FcdoContent),
    Degraded(Value),
}

impl ContentShape {
    pub fn classify(raw: Value) -> Self {
        match FcdoContent::deserialize(&raw) {
            Ok(content) => Self::Strict(content),
            Err(err) => {
                warn!(error = %err, "travel advice failed strict validation, extracting minimal record");
                Self::Degraded(raw)
            }
        }
    }

    /// Never fails: a degraded payload still yields a record for the slug.
    pub fn into_record(self, slug: &str, now: DateTime<Utc>) -> AdvisoryRecord {
        match self {
            Self::Strict(content) => strict_record(content, slug, now),
            Self::Degraded(raw) => degraded_record(&raw, slug, now),
        }
    }
}

fn public_url(slug: &str) -> String {
    format!("{FCDO_PUBLIC_URL}/{slug}")
}

fn opt_value<T: Serialize>(value: Option<T>) -> Value {
    value
        .and_then(|v| serde_json::to_value(v).ok())
        .unwrap_or(Value::Null)
}

fn strict_record(c: FcdoContent, slug: &str, now: DateTime<Utc>) -> AdvisoryRecord {
    let description = c
        .description
        .clone()
        .or_else(|| c.summary.clone())
        .unwrap_or_default();
    let level = parse_fcdo_level(&c.title, Some(description.as_str()));
    let details = c.details.unwrap_or(FcdoDetails {
        reviewed_at: None,
        updated_at: None,
        change_history: None,
    });
    let published_at = [c.public_updated_at.as_deref(), details.reviewed_at.as_deref()]
        .into_iter()
        .flatten()
        .find_map(parse_timestamp)
        .unwrap_or(now);

    let mut payload = Metadata::new();
    payload.insert("description".into(), Value::from(description));
    payload.insert("document_type".into(), opt_value(c.document_type));
    payload.insert("schema_name".into(), opt_value(c.schema_name));
    payload.insert("change_history".into(), opt_value(details.change_history));
    payload.insert("updated_at".into(), opt_value(details.updated_at));
    payload.insert("reviewed_at".into(), opt_value(details.reviewed_at));
    // Only scalar extras are kept; nested documents are large.
    for (key, value) in c.extra {
        if matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
            payload.entry(key).or_insert(value);
        }
    }

    AdvisoryRecord {
        country_iso2: slug_to_iso2(slug),
        source: SOURCE.to_string(),
        level,
        headline: c.title,
        url: public_url(slug),
        published_at,
        payload,
    }
}

fn degraded_record(raw: &Value, slug: &str, now: DateTime<Utc>) -> AdvisoryRecord {
    let text = |key: &str| raw.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty());
    let title = text("title")
        .map(str::to_string)
        .unwrap_or_else(|| format!("Travel advice for {slug}"));
    let description = text("description").or(text("summary")).unwrap_or_default();
    let published_at = [text("public_updated_at"), text("updated_at")]
        .into_iter()
        .flatten()
        .find_map(parse_timestamp)
        .unwrap_or(now);

    let mut payload = Metadata::new();
    payload.insert("degraded".into(), Value::Bool(true));
    payload.insert("description".into(), Value::from(description));
    for key in ["details", "links", "document_type", "schema_name"] {
        if let Some(value) = raw.get(key) {
            payload.insert(key.to_string(), value.clone());
        }
    }

    AdvisoryRecord {
        country_iso2: slug_to_iso2(slug),
        source: SOURCE.to_string(),
        level: parse_fcdo_level(&title, Some(description)),
        headline: title,
        url: public_url(slug),
        published_at,
        payload,
    }
}

#[derive(Debug, Clone)]
pub struct FcdoConnector {
    http: HttpFetcher,
    base_url: String,
}

impl FcdoConnector {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_base_url(http, FCDO_CONTENT_URL)
    }

    pub fn with_base_url(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl UkAdvisorySource for FcdoConnector {
    async fn fetch_uk_advisory(&self, slug: &str) -> Result<AdvisoryRecord, ConnectorError> {
        let url = format!("{}/{slug}", self.base_url);
        let response = self
            .http
            .fetch_json::<Value>(&url, &FetchOptions::default())
            .await?;
        if response.is_not_modified() {
            return Err(ConnectorError::NotModified);
        }
        let body = response
            .data
            .filter(Value::is_object)
            .ok_or_else(|| ConnectorError::schema(SOURCE, format!("no content for {slug}")))?;
        Ok(ContentShape::classify(body).into_record(slug, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use serde_json::json;

    #[test]
    fn rules_apply_in_order() {
        assert_eq!(parse_fcdo_level("Country X", Some("FCDO advises against all travel. Do not travel.")), 4);
        assert_eq!(parse_fcdo_level("Avoid all travel to the border", None), 4);
        assert_eq!(
            parse_fcdo_level("Y", Some("We advise against all but essential travel; avoid all but essential travel")),
            3
        );
        assert_eq!(parse_fcdo_level("Reconsider plans", None), 3);
        assert_eq!(parse_fcdo_level("Z", Some("Check latest advice before you go")), 2);
        assert_eq!(parse_fcdo_level("Germany travel advice", Some("Entry requirements")), 1);
        assert_eq!(
            parse_fcdo_level("Do not travel, reconsider, check latest", None),
            4
        );
    }

    #[test]
    fn strict_content_maps_to_advisory() {
        let raw = json!({
            "title": "Spain travel advice",
            "description": "FCDO travel advice for Spain. Includes safety and security.",
            "public_updated_at": "2024-06-10T09:00:00+01:00",
            "details": {
                "reviewed_at": "2024-06-01T00:00:00Z",
                "change_history": [{ "note": "Updated entry rules", "public_timestamp": "2024-06-10T09:00:00Z" }]
            },
            "document_type": "travel_advice",
            "schema_name": "travel_advice",
            "locale": "en",
            "content_id": "abc-123",
            "links": { "parent": [] }
        });
        let record = ContentShape::classify(raw).into_record("spain", Utc::now());
        assert_eq!(record.country_iso2, "ES");
        assert_eq!(record.level, 1);
        assert_eq!(record.url, "https://www.gov.uk/foreign-travel-advice/spain");
        assert_eq!(record.published_at.day(), 10);
        assert_eq!(record.payload["change_history"][0]["note"], "Updated entry rules");
        assert_eq!(record.payload["content_id"], "abc-123");
        assert!(record.payload.get("links").is_none());
    }

    #[test]
    fn schema_mismatch_still_yields_a_record() {
        let raw = json!({
            "title": 42,
            "summary": "Avoid all but essential travel to parts of the country",
            "updated_at": "2024-02-02T00:00:00Z"
        });
        let record = ContentShape::classify(raw).into_record("czech-republic", Utc::now());
        assert_eq!(record.country_iso2, "CZ");
        assert_eq!(record.headline, "Travel advice for czech-republic");
        assert_eq!(record.level, 3);
        assert_eq!(record.published_at.month(), 2);
        assert_eq!(record.payload["degraded"], true);
    }

    #[test]
    fn unknown_slugs_get_a_two_letter_guess() {
        let record = ContentShape::classify(json!({ "title": "Narnia" })).into_record("narnia", Utc::now());
        assert_eq!(record.country_iso2, "NA");
    }
}
