use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::cache::CounterStore;
use crate::cache::keys::window_bucket_key;
use crate::error::{Error, Result};
use crate::rate_limit::{Decision, Identity, Plan};

pub const DEFAULT_SUB_BUCKETS: u32 = 6;
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Geometry of one plan's window: `sub_buckets` fixed buckets of
/// `bucket_secs` each, indexed by `floor(unix_secs / bucket_secs)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    bucket_secs: i64,
    sub_buckets: i64,
}

impl SlidingWindow {
    pub fn new(window_secs: u64, sub_buckets: u32) -> Self {
        let sub_buckets = i64::from(sub_buckets.max(1));
        let window_secs = i64::try_from(window_secs).unwrap_or(i64::MAX).max(1);
        Self {
            bucket_secs: (window_secs / sub_buckets).max(1),
            sub_buckets,
        }
    }

    pub fn bucket_index(&self, unix_secs: i64) -> i64 {
        unix_secs.div_euclid(self.bucket_secs)
    }

    /// Bucket indexes still inside the window, oldest first.
    pub fn live_buckets(&self, current: i64) -> impl Iterator<Item = i64> {
        (current - self.sub_buckets + 1)..=current
    }

    /// When bucket `index` ages out of the window.
    pub fn expires_at(&self, index: i64) -> i64 {
        (index + self.sub_buckets) * self.bucket_secs
    }

    pub fn window_secs(&self) -> i64 {
        self.bucket_secs * self.sub_buckets
    }
}

/// Live counts for one identity, as read from the store.
struct WindowCount {
    total: i64,
    oldest_live: i64,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    sub_buckets: u32,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, sub_buckets: u32, store_timeout: Duration) -> Self {
        Self {
            store,
            sub_buckets: sub_buckets.max(1),
            store_timeout,
        }
    }

    pub async fn check(&self, identity: &Identity, plan: &Plan) -> Decision {
        self.check_at(identity.clone(), plan.clone(), Utc::now()).await
    }

    /// Counts this request against `identity` and decides admission as of `now`.
    ///
    /// Every check increments, including denied ones, so a client hammering
    /// past its limit keeps itself throttled. Store errors and timeouts never
    /// surface: the request is admitted with `degraded` set.
    pub async fn check_at(&self, identity: Identity, plan: Plan, now: DateTime<Utc>) -> Decision {
        let window = SlidingWindow::new(plan.window_secs, self.sub_buckets);
        let current = window.bucket_index(now.timestamp());

        let counted = tokio::time::timeout(
            self.store_timeout,
            self.count(&identity, &plan, &window, current),
        )
        .await;

        let count = match counted {
            Ok(Ok(count)) => count,
            Ok(Err(err)) => return Self::fail_open(&identity, &plan, now, &err.to_string()),
            Err(_) => return Self::fail_open(&identity, &plan, now, "counter store timed out"),
        };

        let limit = i64::from(plan.requests_per_window);
        let admitted = count.total <= limit;
        let remaining = u32::try_from((limit - count.total).max(0)).unwrap_or(0);
        let reset_at = DateTime::from_timestamp(window.expires_at(count.oldest_live), 0)
            .unwrap_or(now + chrono::Duration::seconds(window.window_secs()));

        if !admitted {
            debug!(
                identity = identity.as_str(),
                plan = %plan.name,
                count = count.total,
                limit,
                "rate limit exceeded"
            );
        }

        Decision {
            admitted,
            limit: plan.requests_per_window,
            remaining,
            reset_at,
            degraded: false,
        }
    }

    async fn count(
        &self,
        identity: &Identity,
        plan: &Plan,
        window: &SlidingWindow,
        current: i64,
    ) -> Result<WindowCount> {
        let current_key = window_bucket_key(identity.as_str(), current);
        let in_current = self
            .store
            .increment_and_get(&current_key, plan.window())
            .await?;

        let earlier: Vec<i64> = window.live_buckets(current).filter(|i| *i != current).collect();
        let keys: Vec<String> = earlier
            .iter()
            .map(|i| window_bucket_key(identity.as_str(), *i))
            .collect();
        let values = self.store.get_many(&keys).await?;

        let mut total = in_current;
        let mut oldest_live = current;
        for (index, key) in earlier.iter().zip(&keys) {
            let value = values.get(key).copied().unwrap_or(0);
            if value < 0 {
                return Err(Error::Internal(format!("negative counter at {key}")));
            }
            if value > 0 {
                total += value;
                oldest_live = oldest_live.min(*index);
            }
        }

        Ok(WindowCount { total, oldest_live })
    }

    fn fail_open(identity: &Identity, plan: &Plan, now: DateTime<Utc>, cause: &str) -> Decision {
        warn!(
            identity = identity.as_str(),
            plan = %plan.name,
            cause,
            "counter store unavailable, admitting without enforcement"
        );
        Decision {
            admitted: true,
            limit: plan.requests_per_window,
            remaining: plan.requests_per_window,
            reset_at: now + chrono::Duration::seconds(i64::try_from(plan.window_secs).unwrap_or(60)),
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounterStore;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        // Aligned to a whole window so bucket boundaries fall on round seconds.
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn limiter(store: Arc<MemoryCounterStore>) -> RateLimiter {
        RateLimiter::new(store, DEFAULT_SUB_BUCKETS, DEFAULT_STORE_TIMEOUT)
    }

    #[test]
    fn test_window_geometry() {
        let window = SlidingWindow::new(60, 6);
        assert_eq!(window.bucket_index(59), 5);
        assert_eq!(window.bucket_index(60), 6);
        assert_eq!(window.live_buckets(6).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(window.expires_at(0), 60);
        assert_eq!(window.window_secs(), 60);
    }

    #[tokio::test]
    async fn test_two_per_minute_scenario() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        let k1 = Identity::new("k1");
        let plan = Plan::new("tiny", 2, 60);

        let first = limiter.check_at(k1.clone(), plan.clone(), at(0)).await;
        assert!(first.admitted);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.reset_at, at(60));

        let second = limiter.check_at(k1.clone(), plan.clone(), at(1)).await;
        assert!(second.admitted);
        assert_eq!(second.remaining, 0);

        let third = limiter.check_at(k1.clone(), plan.clone(), at(2)).await;
        assert!(!third.admitted);
        assert_eq!(third.remaining, 0);
        assert!(!third.degraded);

        let later = limiter.check_at(k1, plan, at(61)).await;
        assert!(later.admitted);
    }

    #[tokio::test]
    async fn test_limit_admits_exactly_limit_requests() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        let id = Identity::new("burst");
        let plan = Plan::new("free", 30, 60);

        for i in 0..30 {
            let decision = limiter.check_at(id.clone(), plan.clone(), at(i)).await;
            assert!(decision.admitted, "request {i} should be admitted");
        }
        let over = limiter.check_at(id, plan, at(30)).await;
        assert!(!over.admitted);
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        let plan = Plan::new("tiny", 1, 60);

        assert!(limiter.check_at(Identity::new("a"), plan.clone(), at(0)).await.admitted);
        assert!(!limiter.check_at(Identity::new("a"), plan.clone(), at(1)).await.admitted);
        assert!(limiter.check_at(Identity::new("b"), plan, at(1)).await.admitted);
    }

    #[tokio::test]
    async fn test_evenly_paced_traffic_is_never_denied() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        let id = Identity::new("paced");
        let plan = Plan::new("pro", 10, 60);

        // One request every 6s is exactly 10 per rolling minute.
        for i in 0..60 {
            let decision = limiter.check_at(id.clone(), plan.clone(), at(i * 6)).await;
            assert!(decision.admitted, "paced request {i} denied");
        }
    }

    #[tokio::test]
    async fn test_reset_at_tracks_oldest_live_bucket() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        let id = Identity::new("reset");
        let plan = Plan::new("tiny", 5, 60);

        limiter.check_at(id.clone(), plan.clone(), at(15)).await;
        let decision = limiter.check_at(id, plan, at(42)).await;
        // Bucket [10, 20) is the oldest with traffic and leaves the window at 70.
        assert_eq!(decision.reset_at, at(70));
        assert_eq!(decision.remaining, 3);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_available(false);
        let limiter = limiter(store);
        let plan = Plan::new("tiny", 1, 60);

        for i in 0..5 {
            let decision = limiter.check_at(Identity::new("k"), plan.clone(), at(i)).await;
            assert!(decision.admitted);
            assert!(decision.degraded);
            assert_eq!(decision.remaining, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_is_bounded_by_timeout() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_latency(Duration::from_secs(30));
        let limiter = RateLimiter::new(store, 6, Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        let decision = limiter
            .check_at(Identity::new("k"), Plan::new("tiny", 1, 60), at(0))
            .await;
        assert!(decision.admitted);
        assert!(decision.degraded);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
