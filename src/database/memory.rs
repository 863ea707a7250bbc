//! In-process [`RecordStore`] with the same upsert semantics as the
//! Postgres store. Used by tests and by the one-shot CLI's `--dry-run`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::database::RecordStore;
use crate::error::{Error, Result};
use crate::ingest::{DatasetType, Record};

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: Mutex<BTreeMap<(DatasetType, String), Record>>,
    fail_next_at: Mutex<Option<usize>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `upsert_batch` fail once it reaches record `index`.
    pub fn fail_next_batch_at(&self, index: usize) {
        if let Ok(mut slot) = self.fail_next_at.lock() {
            *slot = Some(index);
        }
    }

    pub fn len(&self, dataset: DatasetType) -> usize {
        self.rows
            .lock()
            .map(|rows| rows.keys().filter(|(d, _)| *d == dataset).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().map(|rows| rows.is_empty()).unwrap_or(true)
    }

    pub fn get(&self, dataset: DatasetType, natural_key: &str) -> Option<Record> {
        self.rows
            .lock()
            .ok()
            .and_then(|rows| rows.get(&(dataset, natural_key.to_string())).cloned())
    }

    /// All rows for `dataset`, ordered by natural key.
    pub fn snapshot(&self, dataset: DatasetType) -> Vec<Record> {
        self.rows
            .lock()
            .map(|rows| {
                rows.iter()
                    .filter(|((d, _), _)| *d == dataset)
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn poisoned() -> Error {
    Error::Internal("memory record store lock poisoned".into())
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_batch(&self, dataset: DatasetType, records: &[Record]) -> Result<u64> {
        let fail_at = self.fail_next_at.lock().map_err(|_| poisoned())?.take();
        let mut rows = self.rows.lock().map_err(|_| poisoned())?;

        // Stage the whole batch first so a failure applies nothing.
        let mut staged: Vec<&Record> = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if fail_at == Some(i) {
                return Err(Error::TransientInfra {
                    store: "record store",
                    message: format!("injected failure at record {i}"),
                });
            }

            match rows.get(&(dataset, record.natural_key.clone())) {
                Some(existing) if existing.fields == record.fields => {}
                Some(existing) if existing.fetched_at > record.fetched_at => {}
                _ => staged.push(record),
            }
        }

        let written = staged.len() as u64;
        for record in staged {
            rows.insert((dataset, record.natural_key.clone()), record.clone());
        }
        Ok(written)
    }

    async fn recent(&self, dataset: DatasetType, limit: i64) -> Result<Vec<Record>> {
        let mut records = self.snapshot(dataset);
        records.sort_by(|a, b| {
            b.observed_at
                .cmp(&a.observed_at)
                .then_with(|| a.natural_key.cmp(&b.natural_key))
        });
        records.truncate(usize::try_from(limit.max(0)).unwrap_or(0));
        Ok(records)
    }
}
