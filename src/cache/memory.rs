//! In-process [`CounterStore`] for tests and single-node development.
//!
//! Expiry is not modelled: the limiter derives bucket keys from the clock,
//! so a stale bucket is never addressed again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::CounterStore;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, i64>>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    increments: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `TransientInfra`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delays every call, to exercise caller timeouts.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of successful increments so far.
    pub fn increments(&self) -> u64 {
        self.increments.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::TransientInfra {
                store: "counter store",
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

fn poisoned() -> Error {
    Error::Internal("memory counter store lock poisoned".into())
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(&self, key: &str, _ttl: Duration) -> Result<i64> {
        self.enter().await?;
        let mut counters = self.counters.lock().map_err(|_| poisoned())?;
        let count = counters.entry(key.to_string()).or_insert(0);
        *count += 1;
        self.increments.fetch_add(1, Ordering::SeqCst);
        Ok(*count)
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, i64>> {
        self.enter().await?;
        let counters = self.counters.lock().map_err(|_| poisoned())?;
        Ok(keys
            .iter()
            .filter_map(|key| counters.get(key).map(|v| (key.clone(), *v)))
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await
    }
}
