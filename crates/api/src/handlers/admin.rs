use axum::{extract::State, response::IntoResponse, Json};
use scheduler_core::{config::TuningUpdate, CallerContext};
use scheduler_dispatcher::CreationPassReport;
use serde::Serialize;
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    middleware::Operator,
    response::success,
    routes::AppState,
};

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub running: bool,
    pub last_report: Option<CreationPassReport>,
}

pub async fn get_tuning(
    State(state): State<AppState>,
    Operator(ctx): Operator,
) -> ApiResult<impl IntoResponse> {
    ctx.require_operator()?;
    Ok(success(state.dispatcher.tuning.snapshot().await))
}

/// 部分更新运行参数，立即生效
pub async fn update_tuning(
    State(state): State<AppState>,
    Operator(ctx): Operator,
    Json(update): Json<TuningUpdate>,
) -> ApiResult<impl IntoResponse> {
    ctx.require_operator()?;
    let tuning = state.dispatcher.tuning.apply(update).await?;
    info!("{} 更新了调度参数", ctx.principal());
    Ok(success(tuning))
}

/// 立即执行一轮任务创建并返回本轮报告
pub async fn create_tasks(
    State(state): State<AppState>,
    Operator(ctx): Operator,
) -> ApiResult<impl IntoResponse> {
    ctx.require_operator()?;
    info!("{} 手动触发任务创建", ctx.principal());

    let report = state
        .dispatcher
        .controller
        .create_tasks(&CallerContext::processing(), &state.shutdown)
        .await?
        .ok_or_else(|| ApiError::Conflict("已有一轮任务创建正在执行".to_string()))?;
    Ok(success(report))
}

pub async fn get_progress(
    State(state): State<AppState>,
    Operator(ctx): Operator,
) -> ApiResult<impl IntoResponse> {
    ctx.require_operator()?;
    let controller = &state.dispatcher.controller;
    Ok(success(ProgressResponse {
        running: controller.is_running(),
        last_report: controller.last_report().await,
    }))
}
