// Dataset record operations
// Batch upserts keyed on (dataset_type, natural_key)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

use crate::database::RecordStore;
use crate::error::Result;
use crate::ingest::{DatasetType, Record};

/// Rows per INSERT statement; 5 binds per row keeps us well under the
/// 65535 bind parameter limit.
const ROWS_PER_STATEMENT: usize = 1000;

#[derive(Debug, FromRow)]
struct RecordRow {
    natural_key: String,
    observed_at: DateTime<Utc>,
    fields: Json<serde_json::Value>,
    fetched_at: DateTime<Utc>,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Record {
            natural_key: row.natural_key,
            observed_at: row.observed_at,
            fields: row.fields.0,
            fetched_at: row.fetched_at,
        }
    }
}

/// Postgres-backed record store.
#[derive(Clone)]
pub struct PgRecordStore {
    db: Arc<PgPool>,
}

impl PgRecordStore {
    pub fn new(db: Arc<PgPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_batch(&self, dataset: DatasetType, records: &[Record]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        // One transaction per batch; dropping it without commit rolls back.
        let mut tx = self.db.begin().await?;
        let mut written = 0;

        for chunk in records.chunks(ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO dataset_records (dataset_type, natural_key, observed_at, fields, fetched_at) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(dataset.as_str())
                    .push_bind(&record.natural_key)
                    .push_bind(record.observed_at)
                    .push_bind(Json(&record.fields))
                    .push_bind(record.fetched_at);
            });
            builder.push(
                r#"
                ON CONFLICT (dataset_type, natural_key) DO UPDATE SET
                    observed_at = EXCLUDED.observed_at,
                    fields = EXCLUDED.fields,
                    fetched_at = EXCLUDED.fetched_at,
                    updated_at = NOW()
                WHERE dataset_records.fields IS DISTINCT FROM EXCLUDED.fields
                  AND dataset_records.fetched_at <= EXCLUDED.fetched_at
                "#,
            );

            let result = builder.build().execute(&mut *tx).await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn recent(&self, dataset: DatasetType, limit: i64) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT natural_key, observed_at, fields, fetched_at
            FROM dataset_records
            WHERE dataset_type = $1
            ORDER BY observed_at DESC, natural_key
            LIMIT $2
            "#,
        )
        .bind(dataset.as_str())
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(Record::from).collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&*self.db).await?;
        Ok(())
    }
}
