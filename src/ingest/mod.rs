//! Dataset ingestion: the fetch → normalize → upsert contract shared by
//! every dataset adapter, its retry policy and the job runner.

pub mod datasets;
pub mod job;
pub mod retry;
pub mod runner;
pub mod source;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::RecordStore;
use crate::error::{Error, Result};

pub use job::{IngestionJob, JobError, JobResult, JobStatus, Trigger};
pub use retry::{RetryPolicy, RetryState, RetryStep};
pub use runner::IngestContext;
pub use source::{FetchRequest, HttpSourceClient, SourceClient};

/// The registered dataset types. Each maps to exactly one [`Ingester`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetType {
    Tides,
    Sst,
    Currents,
    Turbidity,
}

impl DatasetType {
    pub const ALL: [DatasetType; 4] = [
        DatasetType::Tides,
        DatasetType::Sst,
        DatasetType::Currents,
        DatasetType::Turbidity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetType::Tides => "tides",
            DatasetType::Sst => "sst",
            DatasetType::Currents => "currents",
            DatasetType::Turbidity => "turbidity",
        }
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tides" => Ok(DatasetType::Tides),
            "sst" => Ok(DatasetType::Sst),
            "currents" => Ok(DatasetType::Currents),
            "turbidity" => Ok(DatasetType::Turbidity),
            other => Err(Error::Configuration(format!("unknown dataset type: {other}"))),
        }
    }
}

/// Half-open time range `[start, end)` an ingestion run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Longest span a single run may cover.
pub const MAX_WINDOW_DAYS: i64 = 366;

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(Error::Configuration(format!(
                "window end {end} must be after start {start}"
            )));
        }
        if end - start > chrono::Duration::days(MAX_WINDOW_DAYS) {
            return Err(Error::Configuration(format!(
                "window {start} .. {end} is longer than {MAX_WINDOW_DAYS} days"
            )));
        }
        Ok(Self { start, end })
    }

    /// The `lookback` period ending at `end`.
    pub fn trailing(end: DateTime<Utc>, lookback: chrono::Duration) -> Result<Self> {
        let start = end.checked_sub_signed(lookback).ok_or_else(|| {
            Error::Configuration(format!("lookback {lookback} reaches past the supported date range"))
        })?;
        Self::new(start, end)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

/// One normalized observation.
///
/// `natural_key` identifies the real-world fact, so re-fetching the same
/// observation always lands on the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub natural_key: String,
    pub observed_at: DateTime<Utc>,
    pub fields: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl Record {
    pub fn new(
        natural_key: impl Into<String>,
        observed_at: DateTime<Utc>,
        fields: serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            natural_key: natural_key.into(),
            observed_at,
            fields,
            fetched_at,
        }
    }
}

/// Natural key for gridded observations: coordinates rounded to four
/// decimals plus the observation time.
pub fn grid_key(lat: f64, lon: f64, time: DateTime<Utc>) -> String {
    format!("{:.4}|{:.4}|{}", lat, lon, time.format("%Y-%m-%dT%H:%M:%SZ"))
}

/// Capability set every dataset adapter provides.
#[async_trait]
pub trait Ingester: Send + Sync {
    fn dataset(&self) -> DatasetType;

    /// Window a scheduled run covers, ending at the tick time.
    fn default_lookback(&self) -> chrono::Duration;

    /// Pulls the raw payload for `window`. Each upstream request is bounded by `timeout`.
    async fn fetch(&self, window: &Window, timeout: Duration) -> Result<Vec<u8>>;

    /// Pure and deterministic. A malformed payload is a permanent failure.
    fn normalize(&self, raw: &[u8], fetched_at: DateTime<Utc>) -> Result<Vec<Record>>;

    async fn upsert(&self, store: &dyn RecordStore, records: &[Record]) -> Result<u64> {
        store.upsert_batch(self.dataset(), records).await
    }
}
