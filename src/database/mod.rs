// Record store
// Durable storage for normalized dataset records and read-only API key lookups

pub mod memory;
pub mod operations;
pub mod schema;

use async_trait::async_trait;

use crate::error::Result;
use crate::ingest::{DatasetType, Record};

pub use memory::MemoryRecordStore;
pub use operations::api_keys::PgPlanResolver;
pub use operations::records::PgRecordStore;

/// Upsert-by-natural-key storage for dataset records.
///
/// `upsert_batch` is atomic: either every record of the batch is applied or
/// none is. Re-submitting a key with identical fields is a no-op; different
/// fields overwrite unless the stored row was fetched later. The returned
/// count covers inserted and changed rows only.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert_batch(&self, dataset: DatasetType, records: &[Record]) -> Result<u64>;

    /// Most recent observations first.
    async fn recent(&self, dataset: DatasetType, limit: i64) -> Result<Vec<Record>>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
