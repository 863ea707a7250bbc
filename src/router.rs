use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    AppState,
    middleware::{AdminToken, Admission, log_errors, rate_limit, require_admin},
    routes,
};

/// Metered public data routes. Every request passes admission first.
pub fn dataset_routes(admission: Arc<Admission>) -> Router<AppState> {
    Router::new()
        .route("/datasets/{dataset}", get(routes::datasets::recent_records))
        .layer(axum::middleware::from_fn_with_state(admission, rate_limit))
}

/// Operator routes behind the admin token.
pub fn admin_routes(token: AdminToken) -> Router<AppState> {
    Router::new()
        .route("/admin/ingest/status", get(routes::admin::ingest_statuses))
        .route("/admin/ingest/{dataset}", post(routes::admin::trigger_ingest))
        .route("/admin/ingest/{dataset}/status", get(routes::admin::ingest_status))
        .layer(axum::middleware::from_fn_with_state(token, require_admin))
}

pub fn build_router(state: AppState, admission: Arc<Admission>, admin_token: AdminToken) -> Router {
    let v1 = Router::new()
        .route("/health", get(routes::health::health))
        .merge(dataset_routes(admission))
        .merge(admin_routes(admin_token));

    let router = Router::new()
        .nest("/v1", v1)
        .layer(axum::middleware::from_fn(log_errors));

    // Permissive CORS in debug builds only.
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(tower_http::cors::CorsLayer::permissive())
    };

    router.with_state(state)
}
