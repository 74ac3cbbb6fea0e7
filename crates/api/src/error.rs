use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use scheduler_core::config::ConfigError;
use scheduler_core::SchedulerError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error("请求冲突: {0}")]
    Conflict(String),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("未找到资源: {0}")]
    NotFound(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn classify(&self) -> (StatusCode, String, &'static str, Vec<String>) {
        match self {
            ApiError::Scheduler(SchedulerError::FilterNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("过滤器 ID {id} 不存在"),
                "FILTER_NOT_FOUND",
                vec!["使用 GET /api/filters 查看所有过滤器".to_string()],
            ),
            ApiError::Scheduler(SchedulerError::TaskNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("任务 ID {id} 不存在"),
                "TASK_NOT_FOUND",
                vec!["请检查任务ID是否正确".to_string()],
            ),
            ApiError::Scheduler(SchedulerError::InvalidExpression(msg)) => (
                StatusCode::BAD_REQUEST,
                format!("选择表达式无效: {msg}"),
                "INVALID_EXPRESSION",
                vec![
                    "表达式去掉状态条件后至少要保留一个条件".to_string(),
                    "字段名为 Id、Feed、Type、Status、Create Time".to_string(),
                ],
            ),
            ApiError::Scheduler(err @ SchedulerError::InvalidFilter { .. }) => (
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "INVALID_FILTER",
                vec!["请检查过滤器的时间窗口和表达式".to_string()],
            ),
            ApiError::Scheduler(SchedulerError::InvalidParams(msg))
            | ApiError::Scheduler(SchedulerError::Configuration(msg)) => (
                StatusCode::BAD_REQUEST,
                format!("请求参数错误: {msg}"),
                "BAD_REQUEST",
                vec!["请检查请求参数".to_string()],
            ),
            ApiError::Scheduler(err @ SchedulerError::TaskStateConflict { .. }) => (
                StatusCode::CONFLICT,
                err.to_string(),
                "TASK_STATE_CONFLICT",
                vec!["任务可能已被回收或已有结果，请放弃该任务".to_string()],
            ),
            ApiError::Scheduler(SchedulerError::PermissionDenied(msg)) => (
                StatusCode::FORBIDDEN,
                format!("权限不足: {msg}"),
                "FORBIDDEN",
                vec!["节点只能操作分配给自己的任务".to_string()],
            ),
            ApiError::Scheduler(err) => {
                error!("请求处理失败: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "系统内部错误".to_string(),
                    "INTERNAL_ERROR",
                    vec![
                        "系统遇到内部错误，请稍后重试".to_string(),
                        "查看 GET /health 检查系统状态".to_string(),
                    ],
                )
            }
            ApiError::Config(err) => (
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "INVALID_TUNING",
                vec!["请检查参数取值范围".to_string()],
            ),
            ApiError::Conflict(msg) => (
                StatusCode::CONFLICT,
                format!("资源冲突: {msg}"),
                "CONFLICT",
                vec!["请稍后重试".to_string()],
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                format!("请求参数错误: {msg}"),
                "BAD_REQUEST",
                vec!["请检查请求格式和参数".to_string()],
            ),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                msg.clone(),
                "NOT_FOUND",
                vec!["请检查请求URL是否正确".to_string()],
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message, error_type, suggestions) = self.classify();

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type,
                "code": status.as_u16(),
                "suggestions": suggestions,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ApiError::from(SchedulerError::TaskNotFound { id: 1 }), StatusCode::NOT_FOUND),
            (
                ApiError::from(SchedulerError::InvalidExpression("空".to_string())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(SchedulerError::TaskStateConflict {
                    id: 1,
                    message: "已回收".to_string(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(SchedulerError::PermissionDenied("node:a".to_string())),
                StatusCode::FORBIDDEN,
            ),
            (
                ApiError::from(SchedulerError::Internal("x".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
