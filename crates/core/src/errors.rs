use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("过滤器未找到: {id}")]
    FilterNotFound { id: i64 },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("无效的选择表达式: {0}")]
    InvalidExpression(String),

    /// 只影响单个过滤器的配置错误，其余过滤器照常调度
    #[error("过滤器 {id} 配置错误: {message}")]
    InvalidFilter { id: i64, message: String },

    #[error("任务 {id} 状态冲突: {message}")]
    TaskStateConflict { id: i64, message: String },

    #[error("权限不足: {0}")]
    PermissionDenied(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务执行错误: {0}")]
    Execution(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("无效的参数: {0}")]
    InvalidParams(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl SchedulerError {
    /// 是否为调用方可以忽略的竞争失败
    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedulerError::TaskStateConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::FilterNotFound { .. } | SchedulerError::TaskNotFound { .. }
        )
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
