// Counter store
// Shared atomic counters backing the rate limiter

pub mod keys;
pub mod memory;
pub mod operations;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryCounterStore;
pub use operations::rate_limit::RedisCounterStore;

/// Atomic-increment key/value store with expiry.
///
/// Counters are only ever changed through `increment_and_get`; there is no
/// read-modify-write path.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key`, (re)arming its expiry to `ttl`, and returns the new value.
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Current values; missing or expired keys are absent from the map.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, i64>>;

    async fn ping(&self) -> Result<()>;
}
