use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use bluetrace::{
    database::MemoryRecordStore,
    ingest::{
        DatasetType, HttpSourceClient, IngestContext, JobStatus, RetryPolicy, Trigger, Window,
        datasets::TidesIngester,
    },
    scheduler::{Scheduler, SlotState},
};
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::net::TcpListener;

const STATIONS: [&str; 2] = ["8454000", "8518750"];

/// Fake CO-OPS datagetter. Answers `fail_first` requests with `failure`,
/// then serves three readings per station.
struct Upstream {
    fail_first: AtomicU32,
    failure: StatusCode,
    rejected_station: Option<&'static str>,
    hits: AtomicU32,
}

impl Upstream {
    fn new(fail_first: u32, failure: StatusCode) -> Self {
        Self {
            fail_first: AtomicU32::new(fail_first),
            failure,
            rejected_station: None,
            hits: AtomicU32::new(0),
        }
    }
}

async fn datagetter(
    State(upstream): State<Arc<Upstream>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    upstream.hits.fetch_add(1, Ordering::SeqCst);
    let failing = upstream
        .fail_first
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return (upstream.failure, "upstream unavailable".to_string());
    }

    let station = params.get("station").cloned().unwrap_or_default();
    if upstream.rejected_station == Some(station.as_str()) {
        let body = json!({ "error": { "message": "No data was found." } });
        return (StatusCode::OK, body.to_string());
    }

    let body = json!({
        "metadata": { "id": station },
        "data": [
            { "t": "2024-01-01 00:00", "v": "1.012", "s": "0.003", "f": "0,0,0,0", "q": "v" },
            { "t": "2024-01-01 00:06", "v": "1.034", "s": "0.003", "f": "0,0,0,0", "q": "v" },
            { "t": "2024-01-01 00:12", "v": "", "s": "", "f": "0,0,0,0", "q": "v" },
            { "t": "2024-01-01 00:18", "v": "1.071", "s": "0.002", "f": "0,0,0,0", "q": "v" },
        ],
    });
    (StatusCode::OK, body.to_string())
}

async fn spawn_upstream(upstream: Arc<Upstream>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/datagetter", get(datagetter))
        .with_state(upstream);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_jitter: Duration::from_millis(5),
    }
}

fn window() -> Window {
    Window::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
    )
    .unwrap()
}

async fn tides_scheduler(upstream: Arc<Upstream>) -> (Arc<Scheduler>, Arc<MemoryRecordStore>) {
    let addr = spawn_upstream(upstream).await;
    let records = Arc::new(MemoryRecordStore::new());
    let ingester = TidesIngester::new(
        Arc::new(HttpSourceClient::new().unwrap()),
        format!("http://{addr}/datagetter"),
        STATIONS.iter().map(|s| s.to_string()).collect(),
    );

    let ctx = IngestContext::new(records.clone(), fast_policy(), Duration::from_secs(5));
    let mut scheduler = Scheduler::new(ctx, 2);
    scheduler.register(Arc::new(ingester), Duration::from_secs(3600));
    (Arc::new(scheduler), records)
}

#[tokio::test]
async fn test_transient_upstream_failures_are_retried() {
    let upstream = Arc::new(Upstream::new(2, StatusCode::SERVICE_UNAVAILABLE));
    let (scheduler, records) = tides_scheduler(upstream.clone()).await;

    let result = scheduler
        .run_now(DatasetType::Tides, Some(window()), Trigger::Manual)
        .await
        .unwrap();

    assert!(result.succeeded(), "{result:?}");
    assert_eq!(result.attempts, 3);
    // Two stations, three usable readings each.
    assert_eq!(result.records_seen, 6);
    assert_eq!(result.records_written, 6);
    assert_eq!(records.len(DatasetType::Tides), 6);

    let reading = records
        .get(DatasetType::Tides, "8454000|2024-01-01T00:06Z")
        .unwrap();
    assert_eq!(reading.fields["water_level_m"], 1.034);
    assert!(records.get(DatasetType::Tides, "8454000|2024-01-01T00:12Z").is_none());

    let status = scheduler.status(DatasetType::Tides).unwrap();
    assert_eq!(status.state, SlotState::Idle);
    assert_eq!(status.last_job.unwrap().status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_rerun_over_same_window_writes_nothing() {
    let upstream = Arc::new(Upstream::new(0, StatusCode::SERVICE_UNAVAILABLE));
    let (scheduler, records) = tides_scheduler(upstream).await;

    let first = scheduler
        .run_now(DatasetType::Tides, Some(window()), Trigger::Manual)
        .await
        .unwrap();
    let second = scheduler
        .run_now(DatasetType::Tides, Some(window()), Trigger::Manual)
        .await
        .unwrap();

    assert_eq!(first.records_written, 6);
    assert!(second.succeeded());
    assert_eq!(second.records_seen, 6);
    assert_eq!(second.records_written, 0);
    assert_eq!(records.len(DatasetType::Tides), 6);
}

#[tokio::test]
async fn test_exhausted_retries_leave_store_untouched() {
    let upstream = Arc::new(Upstream::new(u32::MAX, StatusCode::BAD_GATEWAY));
    let (scheduler, records) = tides_scheduler(upstream.clone()).await;

    let result = scheduler
        .run_now(DatasetType::Tides, Some(window()), Trigger::Manual)
        .await
        .unwrap();

    assert_eq!(result.final_status, JobStatus::Failed);
    assert_eq!(result.attempts, 4);
    assert!(result.error.is_some());
    assert_eq!(records.len(DatasetType::Tides), 0);
    // The first station fails each attempt before the second is asked.
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let upstream = Arc::new(Upstream::new(u32::MAX, StatusCode::BAD_REQUEST));
    let (scheduler, _records) = tides_scheduler(upstream.clone()).await;

    let result = scheduler
        .run_now(DatasetType::Tides, Some(window()), Trigger::Manual)
        .await
        .unwrap();

    assert_eq!(result.final_status, JobStatus::Failed);
    assert_eq!(result.attempts, 1);
    // Every station was tried once and rejected.
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejected_station_is_skipped() {
    let upstream = Arc::new(Upstream {
        rejected_station: Some("8518750"),
        ..Upstream::new(0, StatusCode::SERVICE_UNAVAILABLE)
    });
    let (scheduler, records) = tides_scheduler(upstream).await;

    let result = scheduler
        .run_now(DatasetType::Tides, Some(window()), Trigger::Manual)
        .await
        .unwrap();

    assert!(result.succeeded());
    assert_eq!(result.attempts, 1);
    assert_eq!(result.records_written, 3);
    assert!(
        records
            .snapshot(DatasetType::Tides)
            .iter()
            .all(|r| r.natural_key.starts_with("8454000|"))
    );
}
