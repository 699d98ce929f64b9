use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::NaiveDate;
use portalis_core::{IndicatorRecord, Metadata};
use portalis_storage::{
    AnalyticsClient, BackoffPolicy, ClickHouseClient, ClickHouseConfig, FetchError, FetchOptions,
    HttpClientConfig, HttpFetcher, StorageGateway,
};
use serde_json::{json, Value};

#[derive(Default)]
struct Stub {
    hits: AtomicUsize,
    captured: Mutex<Vec<(HashMap<String, String>, HeaderMap, String)>>,
}

async fn flaky(State(stub): State<Arc<Stub>>) -> Response {
    if stub.hits.fetch_add(1, Ordering::SeqCst) == 0 {
        (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "1")], "slow down").into_response()
    } else {
        axum::Json(json!({ "ok": true })).into_response()
    }
}

async fn throttled(State(stub): State<Arc<Stub>>) -> Response {
    stub.hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "3600")], "come back later").into_response()
}

async fn broken(State(stub): State<Arc<Stub>>) -> Response {
    stub.hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::INTERNAL_SERVER_ERROR, "down").into_response()
}

async fn cached(State(stub): State<Arc<Stub>>, headers: HeaderMap) -> Response {
    stub.hits.fetch_add(1, Ordering::SeqCst);
    if headers.get(header::IF_NONE_MATCH).is_some_and(|v| v == "\"v1\"") {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    ([(header::ETAG, "\"v1\"")], axum::Json(json!([1, 2, 3]))).into_response()
}

async fn garbage(State(stub): State<Arc<Stub>>) -> Response {
    stub.hits.fetch_add(1, Ordering::SeqCst);
    ([(header::CONTENT_TYPE, "application/json")], "{not json").into_response()
}

async fn clickhouse(
    State(stub): State<Arc<Stub>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    stub.hits.fetch_add(1, Ordering::SeqCst);
    let is_select = params.get("query").is_some_and(|q| q.starts_with("SELECT"));
    stub.captured
        .lock()
        .expect("lock")
        .push((params, headers, body));
    if is_select {
        "{\"ping\":1}\n".into_response()
    } else {
        StatusCode::OK.into_response()
    }
}

async fn spawn_stub() -> (SocketAddr, Arc<Stub>) {
    let stub = Arc::new(Stub::default());
    let app = Router::new()
        .route("/flaky", get(flaky))
        .route("/broken", get(broken))
        .route("/throttled", get(throttled))
        .route("/cached", get(cached))
        .route("/garbage", get(garbage))
        .route("/", post(clickhouse))
        .with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, stub)
}

fn fast_fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
        ..HttpClientConfig::default()
    })
    .expect("fetcher")
}

#[tokio::test]
async fn rate_limited_once_then_ok_waits_retry_after() {
    let (addr, stub) = spawn_stub().await;
    let fetcher = fast_fetcher();

    let started = Instant::now();
    let response = fetcher
        .fetch_json::<Value>(&format!("http://{addr}/flaky"), &FetchOptions::default())
        .await
        .expect("eventually ok");
    let elapsed = started.elapsed();

    assert_eq!(response.status, 200);
    assert_eq!(response.data, Some(json!({ "ok": true })));
    assert_eq!(stub.hits.load(Ordering::SeqCst), 2);
    assert!(elapsed >= Duration::from_millis(950), "waited {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "waited {elapsed:?}");
}

#[tokio::test]
async fn retry_after_wait_is_capped_by_the_request_timeout() {
    let (addr, stub) = spawn_stub().await;
    let fetcher = fast_fetcher();

    let started = Instant::now();
    let err = fetcher
        .fetch_json::<Value>(
            &format!("http://{addr}/throttled"),
            &FetchOptions::default()
                .timeout(Duration::from_millis(300))
                .retries(1),
        )
        .await
        .expect_err("still throttled");
    let elapsed = started.elapsed();

    assert_eq!(err.status(), Some(429));
    assert_eq!(stub.hits.load(Ordering::SeqCst), 2);
    assert!(elapsed < Duration::from_secs(3), "waited {elapsed:?}");
}

#[tokio::test]
async fn persistent_server_errors_exhaust_retries() {
    let (addr, stub) = spawn_stub().await;
    let fetcher = fast_fetcher();

    let err = fetcher
        .fetch_json::<Value>(
            &format!("http://{addr}/broken"),
            &FetchOptions::default().retries(2),
        )
        .await
        .expect_err("always 500");

    assert_eq!(err.status(), Some(500));
    assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
    assert_eq!(stub.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn conditional_requests_report_not_modified() {
    let (addr, _stub) = spawn_stub().await;
    let fetcher = fast_fetcher();
    let url = format!("http://{addr}/cached");

    let first = fetcher
        .fetch_json::<Vec<u32>>(&url, &FetchOptions::default())
        .await
        .expect("first");
    assert_eq!(first.data, Some(vec![1, 2, 3]));
    let etag = first.etag.expect("etag");

    let second = fetcher
        .fetch_json::<Vec<u32>>(&url, &FetchOptions::default().etag(etag))
        .await
        .expect("second");
    assert!(second.is_not_modified());
    assert!(second.data.is_none());
}

#[tokio::test]
async fn decode_failures_are_not_retried() {
    let (addr, stub) = spawn_stub().await;
    let fetcher = fast_fetcher();

    let err = fetcher
        .fetch_json::<Value>(&format!("http://{addr}/garbage"), &FetchOptions::default())
        .await
        .expect_err("bad json");
    assert!(matches!(err, FetchError::Decode { .. }));
    assert_eq!(stub.hits.load(Ordering::SeqCst), 1);

    let text = fetcher
        .fetch_text(&format!("http://{addr}/garbage"), &FetchOptions::default())
        .await
        .expect("text");
    assert_eq!(text.data.as_deref(), Some("{not json"));
}

#[tokio::test]
async fn unreachable_hosts_fail_after_retries() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = fast_fetcher()
        .fetch_json::<Value>(&format!("http://{addr}/"), &FetchOptions::default().retries(1))
        .await
        .expect_err("refused");
    assert!(err.is_retryable());
    assert!(!err.is_tls());
}

#[tokio::test]
async fn clickhouse_inserts_send_json_each_row() {
    let (addr, stub) = spawn_stub().await;
    let mut config = ClickHouseConfig::new(format!("http://{addr}/"), "portalis");
    config.username = Some("ingest".into());
    config.password = Some("secret".into());
    let client = Arc::new(ClickHouseClient::new(config).expect("client"));
    client.ping().await.expect("ping");

    let gateway = StorageGateway::new(client);
    let records = vec![
        IndicatorRecord {
            country_iso2: "DE".into(),
            source: "worldbank".into(),
            indicator_code: "NY.GDP.PCAP.KD".into(),
            period: NaiveDate::from_ymd_opt(2023, 1, 1).expect("date"),
            value: Some(42_000.5),
            meta: Metadata::new(),
        },
        IndicatorRecord {
            country_iso2: "DE".into(),
            source: "worldbank".into(),
            indicator_code: "NY.GDP.PCAP.KD".into(),
            period: NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"),
            value: None,
            meta: Metadata::new(),
        },
    ];
    assert_eq!(gateway.insert_indicators(&records).await.expect("insert"), 2);

    let captured = stub.captured.lock().expect("lock");
    let (params, headers, body) = captured.last().expect("insert captured");
    assert_eq!(
        params.get("query").map(String::as_str),
        Some("INSERT INTO indicators FORMAT JSONEachRow")
    );
    assert_eq!(params.get("database").map(String::as_str), Some("portalis"));
    assert_eq!(
        params.get("date_time_input_format").map(String::as_str),
        Some("best_effort")
    );
    assert_eq!(headers.get("x-clickhouse-user").expect("user"), "ingest");

    let lines: Vec<Value> = body
        .lines()
        .map(|l| serde_json::from_str(l).expect("row"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["period"], "2023-01-01");
    assert!(lines[1]["value"].is_null());
    assert!(lines[0]["ingested_at"].as_str().is_some());

    // ping before the insert, plus the explicit ping above
    assert_eq!(stub.hits.load(Ordering::SeqCst), 3);
}
