//! # Scheduler API
//!
//! 处理任务调度系统的HTTP接口，基于Axum构建。
//!
//! ## API 端点
//!
//! ### 节点
//! - `POST /api/nodes/{node}/tasks/assign` - 领取任务，请求体 `{"max_count": n}`
//! - `POST /api/nodes/{node}/tasks/abandon` - 归还未开始的任务，请求体 `{"task_ids": [...]}`
//! - `POST /api/nodes/{node}/tasks/release` - 释放节点遗留的全部任务
//! - `POST /api/tasks/{id}/outcome` - 汇报任务结果
//!
//! ### 过滤器
//! - `GET /api/filters` / `POST /api/filters` - 列表 / 创建
//! - `GET /api/filters/{id}` / `DELETE /api/filters/{id}` - 详情 / 删除
//! - `POST /api/filters/{id}/enable`、`/disable`、`/priority`、`/max-processing-tasks`、`/reset`
//! - `GET /api/filters/{id}/tracker` - 扫描进度
//!
//! ### 运维
//! - `GET /api/admin/tuning` / `PUT /api/admin/tuning` - 查看 / 部分更新运行参数
//! - `POST /api/admin/create-tasks` - 立即执行一轮任务创建
//! - `GET /api/admin/progress` - 最近一轮任务创建的报告
//! - `GET /health`、`GET /metrics`
//!
//! 运维接口以 `x-scheduler-user` 请求头中的用户名执行，节点接口以路径中的节点名执行。
//!
//! ## 响应格式
//!
//! ```json
//! { "success": true, "data": { ... }, "message": null, "timestamp": "2024-01-01T00:00:00Z" }
//! ```
//!
//! 错误时返回对应的HTTP状态码：
//!
//! ```json
//! { "error": { "message": "...", "type": "TASK_STATE_CONFLICT", "code": 409, "suggestions": [] } }
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use scheduler_core::config::ApiConfig;
use scheduler_dispatcher::DispatcherComponents;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(
    dispatcher: DispatcherComponents,
    metrics_handle: Option<PrometheusHandle>,
    shutdown: CancellationToken,
    api_config: &ApiConfig,
) -> Router {
    let state = AppState {
        dispatcher,
        metrics_handle,
        shutdown,
    };

    let router = create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    );
    if api_config.cors_enabled {
        router.layer(cors_layer())
    } else {
        router
    }
}
