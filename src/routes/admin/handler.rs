use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::Utc;
use tracing::info;

use crate::AppState;
use crate::error::Result;
use crate::ingest::{DatasetType, JobResult, Trigger};
use crate::scheduler::SlotStatus;

use super::model::TriggerQuery;

/// Runs one ingestion job and answers with its result once it finishes.
/// 409 while the dataset already has a job in flight.
#[axum::debug_handler]
pub async fn trigger_ingest(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    Query(query): Query<TriggerQuery>,
) -> Result<Json<JobResult>> {
    let dataset: DatasetType = dataset.parse()?;
    let window = query.window(Utc::now())?;
    info!("Manual ingestion requested for {}", dataset);

    let result = state.scheduler.run_now(dataset, window, Trigger::Manual).await?;
    Ok(Json(result))
}

#[axum::debug_handler]
pub async fn ingest_statuses(State(state): State<AppState>) -> Json<Vec<SlotStatus>> {
    Json(state.scheduler.statuses())
}

#[axum::debug_handler]
pub async fn ingest_status(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
) -> Result<Json<SlotStatus>> {
    let dataset: DatasetType = dataset.parse()?;
    Ok(Json(state.scheduler.status(dataset)?))
}
