//! 向处理节点分配任务
//!
//! 按过滤器优先级依次取未分配的任务，每个任务通过比较交换领取。
//! 多个调度器实例共享同一个任务表时，同一个任务只会有一个领取者成功。

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, instrument, warn};

use scheduler_core::{config::TuningHandle, CallerContext, SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Filter, TaskHandle, TaskStatus, TaskTransition},
    repositories::{TaskQuery, TaskStore},
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};

use crate::filter_queue::FilterPriorityQueue;

/// 同一个过滤器在领取冲突后重新查询的次数
const MAX_CLAIM_ROUNDS: usize = 3;

pub struct TaskFetcher {
    task_store: Arc<dyn TaskStore>,
    queue: Arc<FilterPriorityQueue>,
    tuning: TuningHandle,
    metrics: Arc<MetricsCollector>,
}

impl TaskFetcher {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        queue: Arc<FilterPriorityQueue>,
        tuning: TuningHandle,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            task_store,
            queue,
            tuning,
            metrics,
        }
    }

    /// 为节点分配最多 `max_count` 个任务
    #[instrument(skip(self, ctx), fields(node = %node_name))]
    pub async fn assign_tasks(
        &self,
        ctx: &CallerContext,
        node_name: &str,
        max_count: i64,
    ) -> SchedulerResult<Vec<TaskHandle>> {
        ctx.require_node(node_name)?;
        if node_name.trim().is_empty() {
            return Err(SchedulerError::InvalidParams("节点名称不能为空".to_string()));
        }
        if max_count <= 0 {
            warn!("节点 {} 请求的任务数量无效: {}", node_name, max_count);
            return Ok(Vec::new());
        }

        let tuning = self.tuning.snapshot().await;
        if !tuning.assign_tasks {
            debug!("任务分配已关闭");
            return Ok(Vec::new());
        }

        let wanted = max_count as usize;
        let mut handles = Vec::with_capacity(wanted.min(1024));
        for filter in self.queue.prioritised_filters().await? {
            if handles.len() >= wanted {
                break;
            }
            if let Err(e) = self.claim_from_filter(&filter, node_name, wanted, &mut handles).await {
                if handles.is_empty() {
                    return Err(e);
                }
                // 已领取的任务必须交给节点，否则只能等超时回收
                error!("为节点 {} 分配任务时出错: {}", node_name, e);
                break;
            }
        }

        self.metrics
            .record_tasks_assigned(node_name, handles.len() as u64);
        StructuredLogger::log_tasks_assigned(node_name, wanted, handles.len());
        Ok(handles)
    }

    async fn claim_from_filter(
        &self,
        filter: &Filter,
        node_name: &str,
        wanted: usize,
        handles: &mut Vec<TaskHandle>,
    ) -> SchedulerResult<()> {
        let mut allowance = wanted - handles.len();
        if let Some(max_processing) = filter.max_processing_tasks {
            let processing = self.task_store.count(filter.id, TaskStatus::Assigned).await?;
            let room = (max_processing as u64).saturating_sub(processing) as usize;
            allowance = allowance.min(room);
        }

        let mut rounds = 0;
        while allowance > 0 && rounds < MAX_CLAIM_ROUNDS {
            rounds += 1;
            let candidates = self
                .task_store
                .find(&TaskQuery::unassigned_for_filter(filter.id, allowance))
                .await?;
            if candidates.is_empty() {
                break;
            }

            let mut conflicts = 0;
            for task in candidates {
                if allowance == 0 {
                    break;
                }
                let transition = TaskTransition::Assign {
                    node_name: node_name.to_string(),
                    at: Utc::now(),
                };
                match self.task_store.compare_and_swap(&task, &transition).await {
                    Ok(Some(assigned)) => {
                        handles.push(TaskHandle {
                            task_id: assigned.id,
                            filter_id: filter.id,
                            meta_id: assigned.meta_id,
                            processor_kind: filter.processor_kind.clone(),
                        });
                        allowance -= 1;
                    }
                    Ok(None) => {
                        conflicts += 1;
                        self.metrics.record_assignment_conflict();
                    }
                    Err(e) if e.is_conflict() => {
                        conflicts += 1;
                        self.metrics.record_assignment_conflict();
                    }
                    Err(e) => return Err(e),
                }
            }

            if conflicts == 0 {
                break;
            }
            debug!("过滤器 {} 领取冲突 {} 次，重新查询", filter.id, conflicts);
        }
        Ok(())
    }
}
