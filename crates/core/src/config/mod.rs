pub mod app_config;
pub mod tuning;
pub mod validation;

pub use app_config::{
    ApiConfig, AppConfig, DatabaseConfig, DispatcherConfig, ObservabilityConfig, StorageKind,
    ShellProcessorConfig, TuningConfig, WorkerConfig,
};
pub use tuning::{SchedulerTuning, TuningHandle, TuningUpdate};
pub use validation::{ConfigValidator, ValidationUtils};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("配置验证失败: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
