use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use scheduler_dispatcher::DispatcherComponents;
use tokio_util::sync::CancellationToken;

use crate::handlers::{
    admin::{create_tasks, get_progress, get_tuning, update_tuning},
    filters::{
        create_filter, delete_filter, disable_filter, enable_filter, get_filter, get_tracker,
        list_filters, reset_tracker, set_max_processing_tasks, set_priority,
    },
    health::health_check,
    metrics::render_metrics,
    nodes::{abandon_tasks, assign_tasks, release_node_tasks},
    tasks::{get_task, report_outcome},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: DispatcherComponents,
    pub metrics_handle: Option<PrometheusHandle>,
    /// 进程停止时取消手动触发的创建任务
    pub shutdown: CancellationToken,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查和指标
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        // 节点领取和归还任务
        .route("/api/nodes/{node}/tasks/assign", post(assign_tasks))
        .route("/api/nodes/{node}/tasks/abandon", post(abandon_tasks))
        .route("/api/nodes/{node}/tasks/release", post(release_node_tasks))
        // 任务
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/outcome", post(report_outcome))
        // 过滤器管理
        .route("/api/filters", get(list_filters).post(create_filter))
        .route("/api/filters/{id}", get(get_filter).delete(delete_filter))
        .route("/api/filters/{id}/enable", post(enable_filter))
        .route("/api/filters/{id}/disable", post(disable_filter))
        .route("/api/filters/{id}/priority", post(set_priority))
        .route(
            "/api/filters/{id}/max-processing-tasks",
            post(set_max_processing_tasks),
        )
        .route("/api/filters/{id}/tracker", get(get_tracker))
        .route("/api/filters/{id}/reset", post(reset_tracker))
        // 运行参数和创建任务
        .route("/api/admin/tuning", get(get_tuning).put(update_tuning))
        .route("/api/admin/create-tasks", post(create_tasks))
        .route("/api/admin/progress", get(get_progress))
        .with_state(state)
}
