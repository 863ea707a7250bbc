//! Per-plan admission control over a shared counter store.

pub mod limiter;
pub mod plan;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::utils::hash_api_key;

pub use limiter::{RateLimiter, SlidingWindow};
pub use plan::{Plan, PlanResolver, PlanTable, StaticPlanResolver};

/// Rate-limit partition key derived from an API key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_api_key(salt: &str, api_key: &str) -> Self {
        Self(hash_api_key(salt, api_key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outcome of one admission check, plus the metadata rendered into
/// `X-RateLimit-*` response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub admitted: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Set when the counter store could not be consulted and the request
    /// was admitted without enforcement.
    pub degraded: bool,
}

impl Decision {
    /// Whole seconds until `reset_at`, at least 1 for a denial.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let secs = (self.reset_at - now).num_seconds().max(0);
        let secs = u64::try_from(secs).unwrap_or(0);
        if self.admitted { secs } else { secs.max(1) }
    }
}
