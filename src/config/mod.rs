use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ingest::datasets::{BoundingBox, erddap, tides};
use crate::ingest::{DatasetType, RetryPolicy};
use crate::rate_limit::PlanTable;
use crate::rate_limit::limiter::{DEFAULT_STORE_TIMEOUT, DEFAULT_SUB_BUCKETS};

pub const DEFAULT_RATE_LIMITS_JSON: &str = r#"{"free": {"requests": 30, "window": 60}, "pro": {"requests": 300, "window": 60}, "enterprise": {"requests": 10000, "window": 60}}"#;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub api_key_salt: String,
    /// Admin routes answer 403 when unset.
    pub admin_token: Option<String>,
    pub plans: PlanTable,
    pub rate_limit_sub_buckets: u32,
    pub counter_store_timeout_ms: u64,
    pub ingest: IngestConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let sub_buckets: u32 = parse_or(&lookup, "RATE_LIMIT_SUB_BUCKETS", DEFAULT_SUB_BUCKETS)?;
        if sub_buckets == 0 {
            return Err(Error::Configuration("RATE_LIMIT_SUB_BUCKETS must be positive".into()));
        }
        let plans_json = lookup("RATE_LIMITS_JSON").unwrap_or_else(|| DEFAULT_RATE_LIMITS_JSON.to_string());

        Ok(Config {
            database_url: required(&lookup, "DATABASE_URL")?,
            redis_url: required(&lookup, "REDIS_URL")?,
            server_host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            server_port: parse_or(&lookup, "SERVER_PORT", 8080)?,
            api_key_salt: required(&lookup, "API_KEY_SALT")?,
            admin_token: lookup("ADMIN_TOKEN").filter(|t| !t.trim().is_empty()),
            plans: PlanTable::from_json(&plans_json, sub_buckets)?,
            rate_limit_sub_buckets: sub_buckets,
            counter_store_timeout_ms: parse_or(
                &lookup,
                "COUNTER_STORE_TIMEOUT_MS",
                DEFAULT_STORE_TIMEOUT.as_millis() as u64,
            )?,
            ingest: IngestConfig::from_lookup(&lookup)?,
        })
    }

    pub fn counter_store_timeout(&self) -> Duration {
        Duration::from_millis(self.counter_store_timeout_ms)
    }
}

/// Scheduler and dataset adapter settings. Also loaded on its own by the
/// one-shot CLI, which may run without a database.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub fetch_timeout: Duration,
    pub intervals: BTreeMap<DatasetType, Duration>,
    pub enabled: Vec<DatasetType>,
    pub noaa_base_url: String,
    pub tide_stations: Vec<String>,
    pub erddap_base_url: String,
    pub sst_dataset_id: String,
    pub currents_dataset_id: String,
    pub bbox: BoundingBox,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            retry: RetryPolicy::default(),
            fetch_timeout: Duration::from_secs(30),
            intervals: DatasetType::ALL
                .into_iter()
                .map(|d| (d, default_interval(d)))
                .collect(),
            enabled: DatasetType::ALL.to_vec(),
            noaa_base_url: tides::DEFAULT_BASE_URL.to_string(),
            tide_stations: tides::DEFAULT_STATIONS.iter().map(|s| s.to_string()).collect(),
            erddap_base_url: erddap::DEFAULT_BASE_URL.to_string(),
            sst_dataset_id: erddap::DEFAULT_SST_DATASET.to_string(),
            currents_dataset_id: erddap::DEFAULT_CURRENTS_DATASET.to_string(),
            bbox: BoundingBox::default(),
        }
    }
}

fn default_interval(dataset: DatasetType) -> Duration {
    match dataset {
        DatasetType::Tides => Duration::from_secs(3600),
        DatasetType::Sst | DatasetType::Currents => Duration::from_secs(6 * 3600),
        DatasetType::Turbidity => Duration::from_secs(24 * 3600),
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let max_concurrency: usize = parse_or(lookup, "INGEST_MAX_CONCURRENCY", defaults.max_concurrency)?;
        if max_concurrency == 0 {
            return Err(Error::Configuration("INGEST_MAX_CONCURRENCY must be positive".into()));
        }

        let retry = RetryPolicy {
            max_attempts: parse_or(lookup, "INGEST_MAX_ATTEMPTS", defaults.retry.max_attempts)?.max(1),
            base_delay: millis_or(lookup, "INGEST_BASE_DELAY_MS", defaults.retry.base_delay)?,
            max_delay: millis_or(lookup, "INGEST_MAX_DELAY_MS", defaults.retry.max_delay)?,
            max_jitter: millis_or(lookup, "INGEST_JITTER_MS", defaults.retry.max_jitter)?,
        };

        let mut intervals = defaults.intervals.clone();
        for dataset in DatasetType::ALL {
            let key = format!("INGEST_{}_INTERVAL_SECS", dataset.as_str().to_ascii_uppercase());
            if let Some(secs) = parse::<u64>(lookup, &key)? {
                if secs == 0 {
                    return Err(Error::Configuration(format!("{key} must be positive")));
                }
                intervals.insert(dataset, Duration::from_secs(secs));
            }
        }

        let enabled = match lookup("INGEST_DATASETS") {
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(DatasetType::from_str)
                .collect::<Result<Vec<_>>>()?,
            None => defaults.enabled.clone(),
        };

        let tide_stations = match lookup("INGEST_TIDE_STATIONS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.tide_stations.clone(),
        };

        Ok(Self {
            max_concurrency,
            retry,
            fetch_timeout: Duration::from_secs(parse_or(
                lookup,
                "INGEST_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )?),
            intervals,
            enabled,
            noaa_base_url: lookup("NOAA_BASE_URL").unwrap_or(defaults.noaa_base_url),
            tide_stations,
            erddap_base_url: lookup("ERDDAP_BASE_URL").unwrap_or(defaults.erddap_base_url),
            sst_dataset_id: lookup("ERDDAP_SST_DATASET").unwrap_or(defaults.sst_dataset_id),
            currents_dataset_id: lookup("ERDDAP_CURRENTS_DATASET").unwrap_or(defaults.currents_dataset_id),
            bbox: defaults.bbox,
        })
    }

    pub fn interval(&self, dataset: DatasetType) -> Duration {
        self.intervals
            .get(&dataset)
            .copied()
            .unwrap_or_else(|| default_interval(dataset))
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key).ok_or_else(|| Error::Configuration(format!("{key} is not set")))
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Configuration(format!("{key}: cannot parse {raw:?}"))),
        None => Ok(None),
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    Ok(parse(lookup, key)?.unwrap_or(default))
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis).unwrap_or(default))
}
