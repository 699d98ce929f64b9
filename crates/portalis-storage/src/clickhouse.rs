//! ClickHouse over its HTTP interface, using `JSONEachRow` in both directions.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::gateway::{AnalyticsClient, GatewayError};

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl ClickHouseConfig {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClickHouseClient {
    http: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseClient {
    pub fn new(config: ClickHouseConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building clickhouse http client")?;
        Ok(Self { http, config })
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    fn request(&self, query: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(&self.config.url).query(&[
            ("database", self.config.database.as_str()),
            ("query", query),
        ]);
        if let Some(user) = &self.config.username {
            builder = builder.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.config.password {
            builder = builder.header("X-ClickHouse-Key", password);
        }
        builder
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, String), reqwest::Error> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }
}

fn is_valid_table(table: &str) -> bool {
    !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_rows(body: &str) -> Result<Vec<Value>, GatewayError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(|e| GatewayError::Query(e.to_string())))
        .collect()
}

#[async_trait]
impl AnalyticsClient for ClickHouseClient {
    async fn ping(&self) -> Result<(), GatewayError> {
        let rows = self.query_rows("SELECT 1 AS ping", &[]).await.map_err(|e| match e {
            GatewayError::Query(message) => GatewayError::Unavailable(message),
            other => other,
        })?;
        if rows.is_empty() {
            return Err(GatewayError::Unavailable("empty ping response".into()));
        }
        Ok(())
    }

    async fn insert_rows(&self, table: &str, rows: Vec<Value>) -> Result<(), GatewayError> {
        if !is_valid_table(table) {
            return Err(GatewayError::Write {
                table: table.to_string(),
                message: "invalid table name".into(),
            });
        }
        let mut body = String::new();
        for row in &rows {
            let line = serde_json::to_string(row).map_err(|e| GatewayError::Serialize {
                table: table.to_string(),
                message: e.to_string(),
            })?;
            body.push_str(&line);
            body.push('\n');
        }

        let query = format!("INSERT INTO {table} FORMAT JSONEachRow");
        let builder = self
            .request(&query)
            .query(&[("date_time_input_format", "best_effort")])
            .body(body);
        let write_error = |message: String| GatewayError::Write {
            table: table.to_string(),
            message,
        };
        let (status, text) = self
            .send(builder)
            .await
            .map_err(|e| write_error(e.to_string()))?;
        if !status.is_success() {
            return Err(write_error(format!("{status}: {}", text.trim())));
        }
        debug!(table, rows = rows.len(), "clickhouse insert accepted");
        Ok(())
    }

    async fn query_rows(
        &self,
        sql: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Value>, GatewayError> {
        let query = format!("{} FORMAT JSONEachRow", sql.trim_end().trim_end_matches(';'));
        let bound: Vec<(String, &str)> = params
            .iter()
            .map(|(name, value)| (format!("param_{name}"), value.as_str()))
            .collect();
        let builder = self.request(&query).query(&bound);
        let (status, text) = self
            .send(builder)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        if !status.is_success() {
            return Err(GatewayError::Query(format!("{status}: {}", text.trim())));
        }
        parse_rows(&text)
    }

    async fn close(&self) -> Result<(), GatewayError> {
        debug!(database = %self.config.database, "releasing clickhouse client");
        Ok(())
    }
}
