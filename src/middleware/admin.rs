use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};

use crate::utils::{error_codes, error_response};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Expected admin token. `None` disables the admin surface.
#[derive(Clone)]
pub struct AdminToken(Option<Arc<str>>);

impl AdminToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.map(Arc::from))
    }

    fn matches(&self, candidate: &str) -> Option<bool> {
        // Digest equality: comparison time is independent of the matching prefix.
        let expected = self.0.as_ref()?;
        Some(Sha256::digest(expected.as_bytes()) == Sha256::digest(candidate.as_bytes()))
    }
}

pub async fn require_admin(
    State(token): State<AdminToken>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    match token.matches(provided) {
        None => error_response(
            StatusCode::FORBIDDEN,
            error_codes::PERMISSION_DENIED,
            "Admin endpoints are disabled",
            Some("Set ADMIN_TOKEN to enable them"),
        ),
        Some(false) => error_response(
            StatusCode::UNAUTHORIZED,
            error_codes::AUTHENTICATION_ERROR,
            "Invalid admin token",
            Some("Provide the admin token in the X-Admin-Token header"),
        ),
        Some(true) => next.run(req).await,
    }
}
