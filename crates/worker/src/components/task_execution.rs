use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{error, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::{OutcomeReport, OutcomeStats, TaskHandle, TaskOutcome};

use super::task_source::TaskSource;
use crate::executor_registry::ExecutorRegistry;

/// 在并发上限内执行任务并汇报结果
pub struct TaskExecutionManager {
    node_name: String,
    executors: ExecutorRegistry,
    source: Arc<dyn TaskSource>,
    max_concurrent_tasks: usize,
    permits: Arc<Semaphore>,
    running_tasks: Arc<RwLock<HashMap<i64, TaskHandle>>>,
}

impl TaskExecutionManager {
    pub fn new(
        node_name: String,
        executors: ExecutorRegistry,
        source: Arc<dyn TaskSource>,
        max_concurrent_tasks: usize,
    ) -> Self {
        let max_concurrent_tasks = max_concurrent_tasks.max(1);
        Self {
            node_name,
            executors,
            source,
            max_concurrent_tasks,
            permits: Arc::new(Semaphore::new(max_concurrent_tasks)),
            running_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn supported_kinds(&self) -> Vec<String> {
        self.executors.kinds()
    }

    /// 当前空闲的执行槽位，全部取走后才向调度器领取对应数量的任务
    pub fn reserve_slots(&self) -> Vec<OwnedSemaphorePermit> {
        let mut reserved = Vec::new();
        while let Ok(permit) = self.permits.clone().try_acquire_owned() {
            reserved.push(permit);
        }
        reserved
    }

    pub async fn running_count(&self) -> usize {
        self.running_tasks.read().await.len()
    }

    pub async fn running_task_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.running_tasks.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 在后台执行任务，槽位在任务汇报结束后归还
    pub fn spawn(self: &Arc<Self>, handle: TaskHandle, permit: OwnedSemaphorePermit) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = handle.task_id;
            if let Err(e) = manager.execute_and_report(handle).await {
                error!("任务 {} 的结果汇报失败: {}", task_id, e);
            }
            drop(permit);
        });
    }

    /// 执行单个任务并汇报结果
    pub async fn execute_and_report(&self, handle: TaskHandle) -> SchedulerResult<TaskOutcome> {
        let task_id = handle.task_id;
        self.running_tasks.write().await.insert(task_id, handle.clone());

        let started = Instant::now();
        let (outcome, stats) = self.execute(&handle).await;
        info!(
            "任务 {} 执行结束: {}, 耗时 {:?}",
            task_id,
            outcome.as_str(),
            started.elapsed()
        );

        self.running_tasks.write().await.remove(&task_id);

        let report = OutcomeReport {
            task_id,
            node_name: self.node_name.clone(),
            outcome,
            stats,
        };
        match self.source.report_outcome(&report).await {
            Ok(()) => Ok(outcome),
            Err(e) if e.is_conflict() => {
                // 任务已超时被回收，结果不再被接受
                warn!("任务 {} 的结果被拒绝: {}", task_id, e);
                Ok(outcome)
            }
            Err(e) => Err(e),
        }
    }

    async fn execute(&self, handle: &TaskHandle) -> (TaskOutcome, OutcomeStats) {
        let Some(executor) = self.executors.get(&handle.processor_kind) else {
            error!("没有处理器类型 {} 的执行器", handle.processor_kind);
            return (
                TaskOutcome::Failed,
                OutcomeStats {
                    error_markers: vec![format!("没有处理器类型 {} 的执行器", handle.processor_kind)],
                    ..Default::default()
                },
            );
        };

        match executor.execute(handle).await {
            Ok(output) => (output.outcome, output.stats),
            Err(e) => {
                error!("任务 {} 执行失败: {}", handle.task_id, e);
                (
                    TaskOutcome::Failed,
                    OutcomeStats {
                        error_markers: vec![e.to_string()],
                        ..Default::default()
                    },
                )
            }
        }
    }

    /// 等待所有正在执行的任务结束
    pub async fn wait_idle(&self) -> SchedulerResult<()> {
        let permits = self
            .permits
            .acquire_many(self.max_concurrent_tasks as u32)
            .await
            .map_err(|e| SchedulerError::Internal(format!("等待任务结束失败: {e}")))?;
        drop(permits);
        Ok(())
    }
}
