use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::{ConfigError, ConfigResult, ConfigValidator};

/// 运行期可调整的调度参数
///
/// 启动时从配置文件复制一份，之后可以通过管理接口在不重启的情况下修改，
/// 下一次创建或领取任务时立即生效。
///
/// # 字段说明
///
/// - `queue_size_cap`: 单个过滤器一轮扫描最多创建的任务数
/// - `skip_non_producing_seconds`: 上一轮没有产出任务的过滤器在这段时间内不再扫描
/// - `assignment_timeout_seconds`: 已分配任务超过该时长仍未汇报结果即被回收
/// - `assign_tasks`: 全局任务分配开关
/// - `max_unassigned_per_filter`: 单个过滤器待分配任务的上限
/// - `max_tasks_per_pass`: 一轮创建的总任务预算，不设置则不限
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerTuning {
    pub queue_size_cap: usize,
    pub skip_non_producing_seconds: u64,
    pub assignment_timeout_seconds: u64,
    pub assign_tasks: bool,
    pub max_unassigned_per_filter: u64,
    pub max_tasks_per_pass: Option<usize>,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            queue_size_cap: 1000,
            skip_non_producing_seconds: 10,
            assignment_timeout_seconds: 600,
            assign_tasks: true,
            max_unassigned_per_filter: 10_000,
            max_tasks_per_pass: None,
        }
    }
}

impl SchedulerTuning {
    pub fn skip_non_producing(&self) -> Duration {
        Duration::from_secs(self.skip_non_producing_seconds)
    }

    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_secs(self.assignment_timeout_seconds)
    }
}

impl ConfigValidator for SchedulerTuning {
    fn validate(&self) -> ConfigResult<()> {
        if self.queue_size_cap == 0 {
            return Err(ConfigError::Validation(
                "tuning.queue_size_cap 必须大于 0".to_string(),
            ));
        }
        if self.assignment_timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "tuning.assignment_timeout_seconds 必须大于 0".to_string(),
            ));
        }
        if self.max_unassigned_per_filter == 0 {
            return Err(ConfigError::Validation(
                "tuning.max_unassigned_per_filter 必须大于 0".to_string(),
            ));
        }
        if self.max_tasks_per_pass == Some(0) {
            return Err(ConfigError::Validation(
                "tuning.max_tasks_per_pass 不能为 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 部分更新，只修改提供了值的字段
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningUpdate {
    pub queue_size_cap: Option<usize>,
    pub skip_non_producing_seconds: Option<u64>,
    pub assignment_timeout_seconds: Option<u64>,
    pub assign_tasks: Option<bool>,
    pub max_unassigned_per_filter: Option<u64>,
    /// 外层 `Some(None)` 表示取消总预算
    #[serde(default, with = "double_option")]
    pub max_tasks_per_pass: Option<Option<usize>>,
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Option<usize>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<usize>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<usize>::deserialize(deserializer).map(Some)
    }
}

/// 共享的调度参数句柄
#[derive(Debug, Clone, Default)]
pub struct TuningHandle {
    inner: Arc<RwLock<SchedulerTuning>>,
}

impl TuningHandle {
    pub fn new(tuning: SchedulerTuning) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tuning)),
        }
    }

    pub async fn snapshot(&self) -> SchedulerTuning {
        self.inner.read().await.clone()
    }

    /// 校验通过后才会替换当前值
    pub async fn apply(&self, update: TuningUpdate) -> ConfigResult<SchedulerTuning> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();

        if let Some(v) = update.queue_size_cap {
            next.queue_size_cap = v;
        }
        if let Some(v) = update.skip_non_producing_seconds {
            next.skip_non_producing_seconds = v;
        }
        if let Some(v) = update.assignment_timeout_seconds {
            next.assignment_timeout_seconds = v;
        }
        if let Some(v) = update.assign_tasks {
            next.assign_tasks = v;
        }
        if let Some(v) = update.max_unassigned_per_filter {
            next.max_unassigned_per_filter = v;
        }
        if let Some(v) = update.max_tasks_per_pass {
            next.max_tasks_per_pass = v;
        }

        next.validate()?;
        if *guard != next {
            info!("调度参数已更新: {:?}", next);
        }
        *guard = next.clone();
        Ok(next)
    }
}
