//! Webhook operations
//!
//! Guarded by `require_admin`. Lets an operator inspect stored provider
//! events, re-run processing for failed ones and clear stuck claims.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use kindred_billing::{IngestStatus, IngestedEventRecord, WebhookReplayResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub status: Option<IngestStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayFailedRequest {
    pub max_events: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<IngestedEventRecord>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct ReplayBatchResponse {
    pub replayed: usize,
    pub succeeded: usize,
    pub results: Vec<WebhookReplayResult>,
}

fn page(limit: Option<i64>, offset: Option<i64>) -> ApiResult<(i64, i64)> {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = offset.unwrap_or(0);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(ApiError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    if offset < 0 {
        return Err(ApiError::Validation("offset must not be negative".into()));
    }
    Ok((limit, offset))
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<EventListResponse>> {
    let (limit, offset) = page(query.limit, query.offset)?;
    let events = state
        .billing
        .webhooks
        .list_events(query.status, limit, offset)
        .await?;
    Ok(Json(EventListResponse {
        events,
        limit,
        offset,
    }))
}

pub async fn list_failed_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<EventListResponse>> {
    let (limit, offset) = page(query.limit, query.offset)?;
    let events = state
        .billing
        .webhooks
        .list_failed_events(limit, offset)
        .await?;
    Ok(Json(EventListResponse {
        events,
        limit,
        offset,
    }))
}

pub async fn replay_event(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<Json<WebhookReplayResult>> {
    tracing::info!(record_id = %record_id, "Admin replay requested");
    Ok(Json(state.billing.webhooks.replay_event(record_id).await?))
}

pub async fn replay_all_failed(
    State(state): State<AppState>,
    req: Option<Json<ReplayFailedRequest>>,
) -> ApiResult<Json<ReplayBatchResponse>> {
    let req = req.map(|Json(req)| req).unwrap_or_default();
    if let Some(max) = req.max_events {
        page(Some(max), None)?;
    }

    let results = state
        .billing
        .webhooks
        .replay_all_failed(req.max_events)
        .await?;
    let succeeded = results.iter().filter(|r| r.success).count();

    tracing::info!(
        replayed = results.len(),
        succeeded = succeeded,
        "Admin replay of failed events completed"
    );

    Ok(Json(ReplayBatchResponse {
        replayed: results.len(),
        succeeded,
        results,
    }))
}

pub async fn reset_event(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.billing.webhooks.reset_stuck_event(record_id).await?;
    tracing::info!(record_id = %record_id, "Admin reset stored event");
    Ok(StatusCode::NO_CONTENT)
}
