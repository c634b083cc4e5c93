//! # Sync Handlers
//!
//! Trigger and operator endpoints. Redundant trigger calls are safe: each call
//! claims its own items and overlapping calls simply drain the queue faster.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dispatcher::ProcessSummary;
use crate::models::{QueueItem, QueueReport};
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

/// Upper bound on a single triggered batch
pub const MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub batch_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueResponse {
    pub item_id: i64,
    pub requeued: bool,
}

/// Run one dispatcher invocation: POST /sync/process
pub async fn process(
    State(state): State<AppState>,
    body: Option<Json<ProcessRequest>>,
) -> ApiResult<Json<ProcessSummary>> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let batch_size = match request.batch_size {
        Some(0) => return Err(ApiError::bad_request("batchSize must be at least 1")),
        Some(size) if size > MAX_BATCH_SIZE => {
            return Err(ApiError::bad_request(format!(
                "batchSize must not exceed {MAX_BATCH_SIZE}"
            )))
        }
        other => other,
    };

    let summary = state.engine.run_once(batch_size).await?;
    Ok(Json(summary))
}

/// Dead letters and blocked correlations: GET /sync/report
pub async fn report(State(state): State<AppState>) -> ApiResult<Json<QueueReport>> {
    Ok(Json(state.engine.report().await?))
}

/// Items of one correlation in sequence order: GET /sync/correlations/:correlation_id
pub async fn correlation(
    State(state): State<AppState>,
    Path(correlation_id): Path<String>,
) -> ApiResult<Json<Vec<QueueItem>>> {
    let items = state.engine.correlation(&correlation_id).await?;
    if items.is_empty() {
        return Err(ApiError::not_found(format!("correlation {correlation_id}")));
    }
    Ok(Json(items))
}

/// Reset a dead-lettered item: POST /sync/dead-letters/:item_id/requeue
pub async fn requeue_dead_letter(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> ApiResult<Json<RequeueResponse>> {
    let requeued = state.engine.requeue_dead_letter(item_id).await?;
    if !requeued {
        return Err(ApiError::Conflict {
            message: format!("queue item {item_id} is not dead-lettered"),
        });
    }
    info!(item_id = item_id, "Operator requeued dead letter over HTTP");
    Ok(Json(RequeueResponse { item_id, requeued }))
}
