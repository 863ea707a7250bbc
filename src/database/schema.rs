use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS dataset_records (
        dataset_type TEXT NOT NULL,
        natural_key TEXT NOT NULL,
        observed_at TIMESTAMPTZ NOT NULL,
        fields JSONB NOT NULL,
        fetched_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (dataset_type, natural_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_dataset_records_observed
        ON dataset_records (dataset_type, observed_at DESC)
    "#,
];

/// Creates the ingestion tables if they are missing. `api_keys` belongs to
/// the web layer and is only read here.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Record store schema ready");
    Ok(())
}
