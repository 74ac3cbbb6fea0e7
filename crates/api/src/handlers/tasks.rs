use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use scheduler_core::{CallerContext, SchedulerError};
use scheduler_domain::entities::OutcomeReport;

use crate::{
    error::{ApiError, ApiResult},
    middleware::Operator,
    response::success,
    routes::AppState,
};

/// 节点汇报任务结果
pub async fn report_outcome(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(report): Json<OutcomeReport>,
) -> ApiResult<impl IntoResponse> {
    if report.task_id != id {
        return Err(ApiError::BadRequest(format!(
            "路径中的任务ID {} 与请求体中的 {} 不一致",
            id, report.task_id
        )));
    }

    let task = state
        .dispatcher
        .outcomes
        .report_outcome(&CallerContext::node(report.node_name.clone()), &report)
        .await?;
    Ok(success(task))
}

/// 获取单个任务
pub async fn get_task(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    ctx.require_operator()?;
    let task = state
        .dispatcher
        .task_store
        .get_by_id(id)
        .await?
        .ok_or(SchedulerError::TaskNotFound { id })?;
    Ok(success(task))
}
