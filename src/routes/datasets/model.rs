use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ingest::{DatasetType, Record};

pub const DEFAULT_LIMIT: i64 = 1000;
pub const MAX_LIMIT: i64 = 10_000;

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

impl RecentQuery {
    pub fn limit(&self) -> Result<i64> {
        match self.limit {
            None => Ok(DEFAULT_LIMIT),
            Some(limit) if (1..=MAX_LIMIT).contains(&limit) => Ok(limit),
            Some(limit) => Err(Error::Configuration(format!(
                "limit must be between 1 and {MAX_LIMIT}, got {limit}"
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub dataset: DatasetType,
    pub count: usize,
    pub limit: i64,
    pub plan: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetPage {
    pub data: Vec<Record>,
    pub meta: DatasetMeta,
}
