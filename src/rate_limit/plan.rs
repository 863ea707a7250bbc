use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rate_limit::Identity;

pub const DEFAULT_PLAN: &str = "free";

/// Immutable quota snapshot for one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub requests_per_window: u32,
    pub window_secs: u64,
}

impl Plan {
    pub fn new(name: impl Into<String>, requests_per_window: u32, window_secs: u64) -> Self {
        Self {
            name: name.into(),
            requests_per_window,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Deserialize)]
struct PlanEntry {
    requests: u32,
    window: u64,
}

/// Plan name → quota, as configured by `RATE_LIMITS_JSON`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanTable {
    plans: HashMap<String, Plan>,
}

impl PlanTable {
    /// Parses `{"free": {"requests": 30, "window": 60}, ...}`. Every window
    /// must split evenly into `sub_buckets`, and the table must define the
    /// default plan.
    pub fn from_json(json: &str, sub_buckets: u32) -> Result<Self> {
        let entries: HashMap<String, PlanEntry> = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("invalid RATE_LIMITS_JSON: {e}")))?;

        let mut plans = HashMap::with_capacity(entries.len());
        for (name, entry) in entries {
            if entry.window == 0 || entry.window % u64::from(sub_buckets) != 0 {
                return Err(Error::Configuration(format!(
                    "plan {name}: window {}s is not a positive multiple of {sub_buckets} sub-buckets",
                    entry.window
                )));
            }
            let plan = Plan::new(name.clone(), entry.requests, entry.window);
            plans.insert(name, plan);
        }

        if !plans.contains_key(DEFAULT_PLAN) {
            return Err(Error::Configuration(format!(
                "RATE_LIMITS_JSON must define the {DEFAULT_PLAN} plan"
            )));
        }
        Ok(Self { plans })
    }

    pub fn get(&self, name: &str) -> Option<&Plan> {
        self.plans.get(name)
    }

    /// Unknown plan names fall back to the free plan.
    pub fn get_or_default(&self, name: &str) -> Plan {
        match self.plans.get(name).or_else(|| self.plans.get(DEFAULT_PLAN)) {
            Some(plan) => plan.clone(),
            None => Plan::new(DEFAULT_PLAN, 0, 60),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plans.keys().map(String::as_str)
    }
}

/// Maps an identity to its plan. `Ok(None)` means the key is unknown or revoked.
#[async_trait]
pub trait PlanResolver: Send + Sync {
    async fn resolve(&self, identity: &Identity) -> Result<Option<Plan>>;
}

/// Fixed identity → plan map, for tests and local development.
#[derive(Debug, Default, Clone)]
pub struct StaticPlanResolver {
    plans: HashMap<Identity, Plan>,
}

impl StaticPlanResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, identity: Identity, plan: Plan) -> Self {
        self.plans.insert(identity, plan);
        self
    }
}

#[async_trait]
impl PlanResolver for StaticPlanResolver {
    async fn resolve(&self, identity: &Identity) -> Result<Option<Plan>> {
        Ok(self.plans.get(identity).cloned())
    }
}
