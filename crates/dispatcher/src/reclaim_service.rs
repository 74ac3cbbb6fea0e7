use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use scheduler_core::{config::TuningHandle, CallerContext, SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::TaskTransition,
    repositories::{TaskQuery, TaskStore},
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};

/// 回收服务配置
#[derive(Debug, Clone)]
pub struct ReclaimConfig {
    /// 每批查询的任务数
    pub batch_size: usize,
    /// 单次回收最多处理的批数
    pub max_batches: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_batches: 20,
        }
    }
}

/// 回收报告
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReclaimReport {
    pub reclaimed_task_ids: Vec<i64>,
    pub conflicts: usize,
    pub duration_ms: u64,
}

#[async_trait]
pub trait ReclaimService: Send + Sync {
    /// 把分配时间超过超时时长的任务退回未分配状态
    async fn reclaim_expired(
        &self,
        ctx: &CallerContext,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ReclaimReport>;
}

pub struct TaskReclaimService {
    task_store: Arc<dyn TaskStore>,
    tuning: TuningHandle,
    metrics: Arc<MetricsCollector>,
    config: ReclaimConfig,
}

impl TaskReclaimService {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        tuning: TuningHandle,
        metrics: Arc<MetricsCollector>,
        config: Option<ReclaimConfig>,
    ) -> Self {
        Self {
            task_store,
            tuning,
            metrics,
            config: config.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ReclaimService for TaskReclaimService {
    async fn reclaim_expired(
        &self,
        ctx: &CallerContext,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ReclaimReport> {
        ctx.require_processing()?;
        let started = Instant::now();

        let timeout = self.tuning.snapshot().await.assignment_timeout();
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| SchedulerError::Configuration(format!("分配超时时间无效: {e}")))?;
        let cutoff = now - timeout;
        debug!("回收 {} 之前分配的任务", cutoff);

        let mut report = ReclaimReport::default();
        for _ in 0..self.config.max_batches {
            let stale = self
                .task_store
                .find(&TaskQuery::assigned_before(cutoff, self.config.batch_size))
                .await?;
            let batch_len = stale.len();

            let mut reclaimed_in_batch = 0;
            for task in stale {
                let previous_node = task.node_name.clone().unwrap_or_default();
                let assigned_seconds = task
                    .assigned_at
                    .map(|at| (now - at).num_seconds())
                    .unwrap_or_default();

                match self
                    .task_store
                    .compare_and_swap(&task, &TaskTransition::Release { at: now })
                    .await?
                {
                    Some(released) => {
                        StructuredLogger::log_task_reclaimed(
                            released.id,
                            &previous_node,
                            assigned_seconds,
                        );
                        report.reclaimed_task_ids.push(released.id);
                        reclaimed_in_batch += 1;
                    }
                    None => {
                        // 节点刚好在回收前汇报了结果
                        report.conflicts += 1;
                    }
                }
            }

            if batch_len < self.config.batch_size || reclaimed_in_batch == 0 {
                break;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        if !report.reclaimed_task_ids.is_empty() {
            self.metrics
                .record_tasks_reclaimed(report.reclaimed_task_ids.len() as u64);
            warn!(
                "回收超时任务 {} 个, 超时时间 {} 秒",
                report.reclaimed_task_ids.len(),
                timeout.num_seconds()
            );
        } else {
            debug!("没有需要回收的任务");
        }
        if report.conflicts > 0 {
            info!("回收时有 {} 个任务状态已变化", report.conflicts);
        }

        Ok(report)
    }
}
