use std::time::Duration;

use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

use crate::AppState;
use crate::error::Result;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub database: String,
    pub redis: String,
}

async fn probe(ping: impl Future<Output = Result<()>>) -> std::result::Result<(), String> {
    match tokio::time::timeout(PING_TIMEOUT, ping).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("timed out".to_string()),
    }
}

/// Dependency check. Always 200; `status` is `degraded` when either store is down.
#[axum::debug_handler]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (database, redis) = tokio::join!(probe(state.records.ping()), probe(state.counters.ping()));
    let status = if database.is_ok() && redis.is_ok() { "ok" } else { "degraded" };
    let describe = |r: std::result::Result<(), String>| match r {
        Ok(()) => "connected".to_string(),
        Err(e) => format!("error: {e}"),
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        service: "bluetrace-api",
        database: describe(database),
        redis: describe(redis),
    })
}
