use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::warn;

use crate::{
    rate_limit::{Decision, Identity, Plan, PlanResolver, RateLimiter},
    utils::{error_codes, error_response},
};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Per-request admission: API key → identity → plan → limiter decision.
pub struct Admission {
    limiter: RateLimiter,
    plans: Arc<dyn PlanResolver>,
    api_key_salt: String,
}

impl Admission {
    pub fn new(limiter: RateLimiter, plans: Arc<dyn PlanResolver>, api_key_salt: String) -> Self {
        Self {
            limiter,
            plans,
            api_key_salt,
        }
    }

    pub async fn check_admission(self: Arc<Self>, mut req: Request<Body>, next: Next) -> Response {
        let api_key = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|k| !k.is_empty());

        let Some(api_key) = api_key else {
            return error_response(
                StatusCode::UNAUTHORIZED,
                error_codes::AUTHENTICATION_ERROR,
                "Missing API key",
                Some("Provide your key in the X-Api-Key header"),
            );
        };
        let identity = Identity::from_api_key(&self.api_key_salt, api_key);

        let plan = match self.plans.resolve(&identity).await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    error_codes::AUTHENTICATION_ERROR,
                    "Invalid or revoked API key",
                    None,
                );
            }
            Err(e) => {
                warn!("Plan lookup failed: {}", e);
                return e.into_response();
            }
        };

        let decision = self.limiter.check(&identity, &plan).await;
        if !decision.admitted {
            return rejection(&plan, &decision);
        }

        req.extensions_mut().insert(identity);
        req.extensions_mut().insert(plan);
        let mut response = next.run(req).await;
        apply_headers(response.headers_mut(), &decision);
        response
    }
}

fn rejection(plan: &Plan, decision: &Decision) -> Response {
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        error_codes::RATE_LIMIT_EXCEEDED,
        &format!("Rate limit exceeded for {} plan", plan.name),
        Some(&format!(
            "Limit: {} requests per {}s. Remaining: {}",
            plan.requests_per_window, plan.window_secs, decision.remaining
        )),
    );
    let headers = response.headers_mut();
    apply_headers(headers, decision);
    headers.insert(
        header::RETRY_AFTER,
        HeaderValue::from(decision.retry_after_secs(Utc::now())),
    );
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(decision.reset_at.timestamp()),
    );
    if decision.degraded {
        headers.insert("x-ratelimit-degraded", HeaderValue::from_static("true"));
    }
}

pub async fn rate_limit(
    State(admission): State<Arc<Admission>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    admission.check_admission(req, next).await
}
