use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use scheduler_core::config::WorkerConfig;
use scheduler_core::{SchedulerError, SchedulerResult};

use crate::executors::{ExecutorAdapter, NoopExecutor, ShellExecutor};

/// 处理器类型到执行器的映射，启动时构建完成后不再变化
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: Arc<HashMap<String, Arc<dyn ExecutorAdapter>>>,
}

impl ExecutorRegistry {
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::default()
    }

    /// 根据节点配置创建全部执行器
    pub fn from_config(config: &WorkerConfig) -> SchedulerResult<Self> {
        let mut builder = Self::builder();
        for kind in &config.processor_kinds {
            builder = builder.register(Arc::new(NoopExecutor::new(kind.clone())))?;
            info!("注册空处理器: {}", kind);
        }
        for (kind, shell) in &config.shell_processors {
            builder = builder.register(Arc::new(ShellExecutor::new(kind.clone(), shell.clone())))?;
            info!("注册命令处理器: {} -> {}", kind, shell.command);
        }

        let registry = builder.build();
        if registry.is_empty() {
            return Err(SchedulerError::Configuration(
                "节点没有配置任何处理器类型".to_string(),
            ));
        }
        Ok(registry)
    }

    pub fn get(&self, processor_kind: &str) -> Option<Arc<dyn ExecutorAdapter>> {
        self.executors.get(processor_kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    executors: HashMap<String, Arc<dyn ExecutorAdapter>>,
}

impl ExecutorRegistryBuilder {
    /// 同一处理器类型只能注册一次
    pub fn register(mut self, executor: Arc<dyn ExecutorAdapter>) -> SchedulerResult<Self> {
        let kind = executor.processor_kind().to_string();
        if self.executors.contains_key(&kind) {
            return Err(SchedulerError::Configuration(format!(
                "处理器类型 {kind} 重复注册"
            )));
        }
        self.executors.insert(kind, executor);
        Ok(self)
    }

    pub fn build(self) -> ExecutorRegistry {
        ExecutorRegistry {
            executors: Arc::new(self.executors),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use scheduler_core::config::ShellProcessorConfig;

    use super::*;

    #[test]
    fn test_registry_from_config() {
        let mut shell_processors = BTreeMap::new();
        shell_processors.insert(
            "index".to_string(),
            ShellProcessorConfig {
                command: "indexer".to_string(),
                args: vec![],
                timeout_seconds: 60,
            },
        );
        let config = WorkerConfig {
            processor_kinds: vec!["noop".to_string(), "archive".to_string()],
            shell_processors,
            ..Default::default()
        };

        let registry = ExecutorRegistry::from_config(&config).unwrap();
        assert_eq!(registry.kinds(), vec!["archive", "index", "noop"]);
        assert!(registry.get("index").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let result = ExecutorRegistry::builder()
            .register(Arc::new(NoopExecutor::new("noop")))
            .and_then(|b| b.register(Arc::new(NoopExecutor::new("noop"))));
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    }

    #[test]
    fn test_empty_config_rejected() {
        let config = WorkerConfig {
            processor_kinds: vec![],
            ..Default::default()
        };
        assert!(ExecutorRegistry::from_config(&config).is_err());
    }
}
