//! Resilient HTTP fetching, the analytical-store gateway, and the local fallback sink.

pub mod clickhouse;
pub mod fallback;
pub mod gateway;
pub mod http;

pub use clickhouse::{ClickHouseClient, ClickHouseConfig};
pub use fallback::{FallbackBlob, FallbackStore};
pub use gateway::{AnalyticsClient, GatewayError, StorageGateway};
pub use http::{
    BackoffPolicy, FetchError, FetchOptions, HttpClientConfig, HttpFetcher, HttpResponse,
};

pub const CRATE_NAME: &str = "portalis-storage";
