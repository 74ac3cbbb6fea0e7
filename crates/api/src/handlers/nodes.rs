use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use scheduler_core::CallerContext;
use serde::Deserialize;

use crate::{
    error::ApiResult,
    response::{success, ReleasedCount},
    routes::AppState,
};

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub max_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct AbandonRequest {
    pub task_ids: Vec<i64>,
}

/// 为节点分配任务
pub async fn assign_tasks(
    State(state): State<AppState>,
    Path(node): Path<String>,
    Json(request): Json<AssignRequest>,
) -> ApiResult<impl IntoResponse> {
    let handles = state
        .dispatcher
        .fetcher
        .assign_tasks(&CallerContext::node(node.clone()), &node, request.max_count)
        .await?;
    Ok(success(handles))
}

/// 节点归还尚未开始的任务
pub async fn abandon_tasks(
    State(state): State<AppState>,
    Path(node): Path<String>,
    Json(request): Json<AbandonRequest>,
) -> ApiResult<impl IntoResponse> {
    let released = state
        .dispatcher
        .outcomes
        .abandon_tasks(&CallerContext::node(node.clone()), &node, &request.task_ids)
        .await?;
    Ok(success(ReleasedCount { released }))
}

/// 节点重启时释放遗留的任务
pub async fn release_node_tasks(
    State(state): State<AppState>,
    Path(node): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let released = state
        .dispatcher
        .outcomes
        .release_node_tasks(&CallerContext::node(node.clone()), &node)
        .await?;
    Ok(success(ReleasedCount { released }))
}
