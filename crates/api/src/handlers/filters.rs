use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use scheduler_dispatcher::FilterScanState;
use scheduler_domain::entities::{Filter, FilterTracker, NewFilter};
use serde::{Deserialize, Serialize};

use crate::{
    error::ApiResult,
    middleware::Operator,
    response::{created, success, ApiResponse},
    routes::AppState,
};

#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: i32,
}

#[derive(Debug, Deserialize)]
pub struct MaxProcessingRequest {
    pub max_processing_tasks: Option<u32>,
}

/// 过滤器详情，附带扫描进度和最近一次扫描情况
#[derive(Debug, Serialize)]
pub struct FilterDetail {
    #[serde(flatten)]
    pub filter: Filter,
    pub tracker: FilterTracker,
    pub last_scan: Option<FilterScanState>,
}

pub async fn list_filters(
    State(state): State<AppState>,
    Operator(ctx): Operator,
) -> ApiResult<impl IntoResponse> {
    let filters = state.dispatcher.registry.list(&ctx).await?;
    Ok(success(filters))
}

pub async fn create_filter(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Json(request): Json<NewFilter>,
) -> ApiResult<impl IntoResponse> {
    let filter = state.dispatcher.registry.create(&ctx, request).await?;
    Ok(created(filter))
}

pub async fn get_filter(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let registry = &state.dispatcher.registry;
    let filter = registry.get(&ctx, id).await?;
    let tracker = registry.tracker(&ctx, id).await?;
    let last_scan = state.dispatcher.queue.scan_state(id).await;
    Ok(success(FilterDetail {
        filter,
        tracker,
        last_scan,
    }))
}

pub async fn delete_filter(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.dispatcher.registry.delete(&ctx, id).await?;
    Ok(ApiResponse::success(id).with_message(format!("过滤器 {id} 已删除")))
}

pub async fn enable_filter(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let filter = state.dispatcher.registry.set_enabled(&ctx, id, true).await?;
    Ok(success(filter))
}

pub async fn disable_filter(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let filter = state.dispatcher.registry.set_enabled(&ctx, id, false).await?;
    Ok(success(filter))
}

pub async fn set_priority(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Path(id): Path<i64>,
    Json(request): Json<PriorityRequest>,
) -> ApiResult<impl IntoResponse> {
    let filter = state
        .dispatcher
        .registry
        .set_priority(&ctx, id, request.priority)
        .await?;
    Ok(success(filter))
}

pub async fn set_max_processing_tasks(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Path(id): Path<i64>,
    Json(request): Json<MaxProcessingRequest>,
) -> ApiResult<impl IntoResponse> {
    let filter = state
        .dispatcher
        .registry
        .set_max_processing_tasks(&ctx, id, request.max_processing_tasks)
        .await?;
    Ok(success(filter))
}

pub async fn get_tracker(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let tracker = state.dispatcher.registry.tracker(&ctx, id).await?;
    Ok(success(tracker))
}

/// 清除过滤器的错误或完成状态
pub async fn reset_tracker(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let tracker = state.dispatcher.registry.reset_tracker(&ctx, id).await?;
    Ok(success(tracker))
}
