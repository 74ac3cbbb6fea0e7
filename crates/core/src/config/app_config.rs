use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::{
    tuning::SchedulerTuning,
    validation::{ConfigValidator, ValidationUtils},
    ConfigError, ConfigResult,
};

pub type TuningConfig = SchedulerTuning;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub tuning: TuningConfig,
    pub worker: WorkerConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub storage: StorageKind,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::Sqlite,
            url: "sqlite://data/scheduler.db?mode=rwc".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
        }
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.storage == StorageKind::Sqlite {
            ValidationUtils::validate_not_empty(&self.url, "database.url")?;
            if !self.url.starts_with("sqlite:") {
                return Err(ConfigError::Validation(format!(
                    "database.url 必须是 sqlite 连接串: {}",
                    self.url
                )));
            }
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections 必须大于 0".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::Validation(
                "database.min_connections 不能大于 max_connections".to_string(),
            ));
        }
        ValidationUtils::validate_timeout_seconds(
            self.connection_timeout_seconds,
            "database.connection_timeout_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 周期性创建任务的间隔
    pub create_interval_seconds: u64,
    /// 启动时先执行一轮创建
    pub create_on_startup: bool,
    /// 一轮创建中并发处理过滤器的数量
    pub creation_concurrency: usize,
    /// 回收超时任务的扫描间隔
    pub reclaim_interval_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            create_interval_seconds: 10,
            create_on_startup: true,
            creation_concurrency: 1,
            reclaim_interval_seconds: 60,
        }
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(
            self.create_interval_seconds,
            "dispatcher.create_interval_seconds",
        )?;
        ValidationUtils::validate_count(
            self.creation_concurrency,
            "dispatcher.creation_concurrency",
            64,
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.reclaim_interval_seconds,
            "dispatcher.reclaim_interval_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 为空时使用主机名
    pub node_name: String,
    /// 远程调度器地址，为空时直接使用本进程内的调度器
    pub dispatcher_url: Option<String>,
    pub max_concurrent_tasks: usize,
    pub poll_interval_seconds: u64,
    /// 不做任何处理直接完成的处理器类型
    pub processor_kinds: Vec<String>,
    /// 处理器类型到外部命令的映射
    pub shell_processors: BTreeMap<String, ShellProcessorConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_name: String::new(),
            dispatcher_url: None,
            max_concurrent_tasks: 5,
            poll_interval_seconds: 5,
            processor_kinds: vec!["noop".to_string()],
            shell_processors: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellProcessorConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_shell_timeout")]
    pub timeout_seconds: u64,
}

fn default_shell_timeout() -> u64 {
    300
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_count(
            self.max_concurrent_tasks,
            "worker.max_concurrent_tasks",
            1000,
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.poll_interval_seconds,
            "worker.poll_interval_seconds",
        )?;
        if let Some(url) = &self.dispatcher_url {
            ValidationUtils::validate_not_empty(url, "worker.dispatcher_url")?;
        }
        for kind in &self.processor_kinds {
            ValidationUtils::validate_not_empty(kind, "worker.processor_kinds")?;
        }
        for (kind, shell) in &self.shell_processors {
            if self.processor_kinds.contains(kind) {
                return Err(ConfigError::Validation(format!(
                    "处理器类型 {kind} 同时配置在 processor_kinds 和 shell_processors 中"
                )));
            }
            ValidationUtils::validate_not_empty(&shell.command, "worker.shell_processors.command")?;
            ValidationUtils::validate_timeout_seconds(
                shell.timeout_seconds,
                "worker.shell_processors.timeout_seconds",
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            cors_enabled: true,
        }
    }
}

impl ConfigValidator for ApiConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.bind_address, "api.bind_address")?;
        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "api.bind_address 格式无效: {}",
                self.bind_address
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

impl ConfigValidator for ObservabilityConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_one_of(
            &self.log_level,
            "observability.log_level",
            &["trace", "debug", "info", "warn", "error"],
        )?;
        ValidationUtils::validate_one_of(
            &self.log_format,
            "observability.log_format",
            &["json", "pretty"],
        )?;
        Ok(())
    }
}

impl AppConfig {
    /// 加载配置
    ///
    /// 指定的文件必须存在；未指定时依次查找默认位置，都不存在则使用内置默认值。
    /// 环境变量 `SCHEDULER__SECTION__FIELD` 覆盖文件中的值。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/scheduler.toml", "scheduler.toml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.database.validate()?;
        self.dispatcher.validate()?;
        self.tuning.validate()?;
        self.worker.validate()?;
        self.api.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}
