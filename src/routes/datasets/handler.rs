use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};

use crate::AppState;
use crate::error::Result;
use crate::ingest::DatasetType;
use crate::rate_limit::Plan;

use super::model::{DatasetMeta, DatasetPage, RecentQuery};

/// Most recent observations for one dataset, newest first.
#[axum::debug_handler]
pub async fn recent_records(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    Query(query): Query<RecentQuery>,
    Extension(plan): Extension<Plan>,
) -> Result<Json<DatasetPage>> {
    let dataset: DatasetType = dataset.parse()?;
    let limit = query.limit()?;

    let data = state.records.recent(dataset, limit).await?;
    Ok(Json(DatasetPage {
        meta: DatasetMeta {
            dataset,
            count: data.len(),
            limit,
            plan: plan.name,
        },
        data,
    }))
}
