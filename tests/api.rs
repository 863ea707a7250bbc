use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use bluetrace::{
    AppState,
    cache::MemoryCounterStore,
    database::MemoryRecordStore,
    ingest::{DatasetType, IngestContext, RetryPolicy, datasets::BoundingBox, datasets::TurbidityDemoIngester},
    middleware::{AdminToken, Admission},
    rate_limit::{Identity, Plan, RateLimiter, StaticPlanResolver},
    router::build_router,
    scheduler::Scheduler,
};
use serde_json::Value;
use tower::ServiceExt;

const SALT: &str = "test-salt";
const FREE_KEY: &str = "bt_sk_free0001.material";
const PRO_KEY: &str = "bt_sk_pro00001.material";
const ADMIN: &str = "admin-secret";

struct Harness {
    app: Router,
    counters: Arc<MemoryCounterStore>,
    records: Arc<MemoryRecordStore>,
}

fn harness(admin_token: Option<&str>) -> Harness {
    let counters = Arc::new(MemoryCounterStore::new());
    let records = Arc::new(MemoryRecordStore::new());

    let resolver = StaticPlanResolver::new()
        .with(Identity::from_api_key(SALT, FREE_KEY), Plan::new("free", 2, 60))
        .with(Identity::from_api_key(SALT, PRO_KEY), Plan::new("pro", 300, 60));
    let limiter = RateLimiter::new(counters.clone(), 6, Duration::from_millis(200));
    let admission = Arc::new(Admission::new(limiter, Arc::new(resolver), SALT.to_string()));

    let ctx = IngestContext::new(records.clone(), RetryPolicy::default(), Duration::from_secs(5));
    let mut scheduler = Scheduler::new(ctx, 2);
    scheduler.register(
        Arc::new(TurbidityDemoIngester::new(BoundingBox::default())),
        Duration::from_secs(86_400),
    );

    let state = AppState {
        records: records.clone(),
        counters: counters.clone(),
        scheduler: Arc::new(scheduler),
    };
    let app = build_router(
        state,
        admission,
        AdminToken::new(admin_token.map(str::to_string)),
    );
    Harness {
        app,
        counters,
        records,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn get(uri: &str, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(key) = api_key {
        builder = builder.header("X-Api-Key", key);
    }
    builder.body(Body::empty()).unwrap()
}

fn admin(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("X-Admin-Token", token);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_missing_api_key_is_rejected() {
    let h = harness(None);
    let (status, _, body) = send(&h.app, get("/v1/datasets/tides", None)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTHENTICATION_ERROR");
    assert_eq!(h.counters.increments(), 0);
}

#[tokio::test]
async fn test_unknown_api_key_is_rejected() {
    let h = harness(None);
    let (status, _, body) = send(&h.app, get("/v1/datasets/tides", Some("bt_sk_nope.nope"))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["message"], "Invalid or revoked API key");
}

#[tokio::test]
async fn test_quota_headers_and_denial() {
    let h = harness(None);

    let (status, headers, body) = send(&h.app, get("/v1/datasets/turbidity", Some(FREE_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-ratelimit-limit"], "2");
    assert_eq!(headers["x-ratelimit-remaining"], "1");
    assert!(headers.contains_key("x-ratelimit-reset"));
    assert!(!headers.contains_key("x-ratelimit-degraded"));
    assert_eq!(body["meta"]["plan"], "free");

    let (status, headers, _) = send(&h.app, get("/v1/datasets/turbidity", Some(FREE_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-ratelimit-remaining"], "0");

    let (status, headers, body) = send(&h.app, get("/v1/datasets/turbidity", Some(FREE_KEY))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["error"]["message"], "Rate limit exceeded for free plan");
    let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));

    // Another key has its own window.
    let (status, _, _) = send(&h.app, get("/v1/datasets/turbidity", Some(PRO_KEY))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_counter_store_outage_admits_with_degraded_flag() {
    let h = harness(None);
    h.counters.set_available(false);

    for _ in 0..5 {
        let (status, headers, _) = send(&h.app, get("/v1/datasets/tides", Some(FREE_KEY))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-ratelimit-degraded"], "true");
    }
}

#[tokio::test]
async fn test_invalid_dataset_and_limit() {
    let h = harness(None);

    let (status, _, body) = send(&h.app, get("/v1/datasets/bathy", Some(PRO_KEY))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _, _) = send(&h.app, get("/v1/datasets/tides?limit=0", Some(PRO_KEY))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_reports_degraded_store() {
    let h = harness(None);

    let (status, _, body) = send(&h.app, get("/v1/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["redis"], "connected");

    h.counters.set_available(false);
    let (status, _, body) = send(&h.app, get("/v1/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert!(body["redis"].as_str().unwrap().starts_with("error:"));
    assert_eq!(body["database"], "connected");
}

#[tokio::test]
async fn test_admin_routes_disabled_without_token() {
    let h = harness(None);
    let (status, _, body) = send(&h.app, admin("GET", "/v1/admin/ingest/status", Some("anything"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "PERMISSION_DENIED");
}

#[tokio::test]
async fn test_admin_requires_matching_token() {
    let h = harness(Some(ADMIN));
    let (status, _, _) = send(&h.app, admin("GET", "/v1/admin/ingest/status", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(&h.app, admin("GET", "/v1/admin/ingest/status", Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_manual_trigger_then_read_back() {
    let h = harness(Some(ADMIN));

    let (status, _, job) = send(
        &h.app,
        admin(
            "POST",
            "/v1/admin/ingest/turbidity?start=2024-01-01T00:00:00Z&end=2024-01-08T00:00:00Z",
            Some(ADMIN),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["final_status"], "succeeded");
    assert_eq!(job["records_written"], 84);
    assert_eq!(h.records.len(DatasetType::Turbidity), 84);

    let (status, _, slot) = send(&h.app, admin("GET", "/v1/admin/ingest/turbidity/status", Some(ADMIN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(slot["state"], "idle");
    assert_eq!(slot["last_job"]["status"], "succeeded");

    let (status, _, page) = send(&h.app, get("/v1/datasets/turbidity?limit=5", Some(PRO_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["meta"]["count"], 5);
    assert_eq!(page["data"][0]["observed_at"], "2024-01-07T12:00:00Z");

    // Same window again: nothing changes.
    let (_, _, again) = send(
        &h.app,
        admin(
            "POST",
            "/v1/admin/ingest/turbidity?start=2024-01-01T00:00:00Z&end=2024-01-08T00:00:00Z",
            Some(ADMIN),
        ),
    )
    .await;
    assert_eq!(again["records_written"], 0);
    assert_eq!(h.records.len(DatasetType::Turbidity), 84);
}

#[tokio::test]
async fn test_trigger_for_unregistered_dataset() {
    let h = harness(Some(ADMIN));
    let (status, _, body) = send(&h.app, admin("POST", "/v1/admin/ingest/tides", Some(ADMIN))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("tides"));

    let (status, _, _) = send(&h.app, admin("GET", "/v1/admin/ingest/status", Some(ADMIN))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_trigger_rejects_oversized_window() {
    let h = harness(Some(ADMIN));

    let (status, _, body) = send(
        &h.app,
        admin(
            "POST",
            "/v1/admin/ingest/turbidity?start=0001-01-01T00:00:00Z&end=9999-01-01T00:00:00Z",
            Some(ADMIN),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _, _) = send(&h.app, admin("POST", "/v1/admin/ingest/turbidity?days=367", Some(ADMIN))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(h.records.len(DatasetType::Turbidity), 0);
    let (_, _, slot) = send(&h.app, admin("GET", "/v1/admin/ingest/turbidity/status", Some(ADMIN))).await;
    assert_eq!(slot["state"], "idle");
}
