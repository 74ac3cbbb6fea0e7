//! 节点任务的结果汇报与归还

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use scheduler_core::{CallerContext, SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{OutcomeReport, Task, TaskOutcome, TaskTransition},
    repositories::{TaskQuery, TaskStore},
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};

pub struct TaskOutcomeService {
    task_store: Arc<dyn TaskStore>,
    metrics: Arc<MetricsCollector>,
}

impl TaskOutcomeService {
    pub fn new(task_store: Arc<dyn TaskStore>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            task_store,
            metrics,
        }
    }

    /// 记录任务的最终结果
    ///
    /// 只有当前持有该任务的节点可以汇报；任务已被回收或已结束时返回 `TaskStateConflict`。
    #[instrument(skip(self, ctx, report), fields(task_id = report.task_id, node = %report.node_name))]
    pub async fn report_outcome(
        &self,
        ctx: &CallerContext,
        report: &OutcomeReport,
    ) -> SchedulerResult<Task> {
        ctx.require_node(&report.node_name)?;

        let task = self
            .task_store
            .get_by_id(report.task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: report.task_id })?;

        if !task.is_assigned_to(&report.node_name) {
            return Err(SchedulerError::TaskStateConflict {
                id: task.id,
                message: format!(
                    "任务状态为 {}，分配节点为 {}，不接受节点 {} 的结果",
                    task.status,
                    task.node_name.as_deref().unwrap_or("无"),
                    report.node_name
                ),
            });
        }

        let now = Utc::now();
        let transition = match report.outcome {
            TaskOutcome::Complete => TaskTransition::Complete {
                at: now,
                stats: report.stats.clone(),
            },
            TaskOutcome::Failed => TaskTransition::Fail {
                at: now,
                stats: report.stats.clone(),
            },
        };

        let updated = self
            .task_store
            .compare_and_swap(&task, &transition)
            .await?
            .ok_or_else(|| SchedulerError::TaskStateConflict {
                id: task.id,
                message: "任务在汇报期间被回收或已有结果".to_string(),
            })?;

        self.metrics.record_task_outcome(report.outcome.as_str());
        StructuredLogger::log_task_outcome(
            updated.id,
            &report.node_name,
            report.outcome.as_str(),
            report.stats.records_read,
        );
        Ok(updated)
    }

    /// 节点放弃尚未开始处理的任务，返回实际归还的数量
    pub async fn abandon_tasks(
        &self,
        ctx: &CallerContext,
        node_name: &str,
        task_ids: &[i64],
    ) -> SchedulerResult<usize> {
        ctx.require_node(node_name)?;

        let mut released = 0;
        for id in task_ids {
            let Some(task) = self.task_store.get_by_id(*id).await? else {
                debug!("归还的任务 {} 不存在", id);
                continue;
            };
            if !task.is_assigned_to(node_name) {
                debug!("{} 不属于节点 {}，忽略", task.entity_description(), node_name);
                continue;
            }
            if self.release(&task).await? {
                released += 1;
            }
        }

        if released > 0 {
            self.metrics.record_tasks_abandoned(released as u64);
            info!("节点 {} 归还任务 {} 个", node_name, released);
        }
        Ok(released)
    }

    /// 节点启动时归还上一次运行遗留的全部任务
    pub async fn release_node_tasks(
        &self,
        ctx: &CallerContext,
        node_name: &str,
    ) -> SchedulerResult<usize> {
        ctx.require_node(node_name)?;

        let tasks = self
            .task_store
            .find(&TaskQuery::assigned_to_node(node_name))
            .await?;
        let mut released = 0;
        for task in &tasks {
            if self.release(task).await? {
                released += 1;
            }
        }

        if released > 0 {
            self.metrics.record_tasks_abandoned(released as u64);
            info!("释放节点 {} 遗留的任务 {} 个", node_name, released);
        }
        Ok(released)
    }

    async fn release(&self, task: &Task) -> SchedulerResult<bool> {
        let transition = TaskTransition::Release { at: Utc::now() };
        Ok(self
            .task_store
            .compare_and_swap(task, &transition)
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::entities::{OutcomeStats, TaskStatus};
    use scheduler_infrastructure::InMemoryTaskStore;
    use scheduler_domain::repositories::CreateOutcome;

    async fn assigned_task(store: &InMemoryTaskStore, meta_id: i64, node: &str) -> Task {
        let CreateOutcome::Created(task) = store.create(1, meta_id, Utc::now()).await.unwrap() else {
            panic!("任务应当被创建");
        };
        store
            .compare_and_swap(
                &task,
                &TaskTransition::Assign {
                    node_name: node.to_string(),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap()
            .unwrap()
    }

    fn service(store: Arc<InMemoryTaskStore>) -> TaskOutcomeService {
        TaskOutcomeService::new(store, Arc::new(MetricsCollector::new().unwrap()))
    }

    fn report(task_id: i64, node: &str, outcome: TaskOutcome) -> OutcomeReport {
        OutcomeReport {
            task_id,
            node_name: node.to_string(),
            outcome,
            stats: OutcomeStats {
                records_read: 12,
                records_written: 10,
                error_markers: vec![],
            },
        }
    }

    #[tokio::test]
    async fn test_report_outcome_from_owner() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = assigned_task(&store, 1, "node-a").await;
        let service = service(store.clone());

        let done = service
            .report_outcome(
                &CallerContext::node("node-a"),
                &report(task.id, "node-a", TaskOutcome::Complete),
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Complete);
        assert_eq!(done.records_read, 12);

        // 重复汇报被拒绝
        let again = service
            .report_outcome(
                &CallerContext::node("node-a"),
                &report(task.id, "node-a", TaskOutcome::Failed),
            )
            .await;
        assert!(matches!(again, Err(SchedulerError::TaskStateConflict { .. })));
    }

    #[tokio::test]
    async fn test_report_outcome_from_other_node_is_rejected() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = assigned_task(&store, 1, "node-a").await;
        let service = service(store.clone());

        let result = service
            .report_outcome(
                &CallerContext::node("node-b"),
                &report(task.id, "node-b", TaskOutcome::Complete),
            )
            .await;
        assert!(matches!(result, Err(SchedulerError::TaskStateConflict { .. })));

        let missing = service
            .report_outcome(
                &CallerContext::node("node-a"),
                &report(999, "node-a", TaskOutcome::Complete),
            )
            .await;
        assert!(matches!(missing, Err(SchedulerError::TaskNotFound { id: 999 })));
    }

    #[tokio::test]
    async fn test_abandon_only_releases_own_tasks() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mine = assigned_task(&store, 1, "node-a").await;
        let theirs = assigned_task(&store, 2, "node-b").await;
        let service = service(store.clone());

        let released = service
            .abandon_tasks(&CallerContext::node("node-a"), "node-a", &[mine.id, theirs.id, 404])
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert_eq!(
            store.get_by_id(mine.id).await.unwrap().unwrap().status,
            TaskStatus::Unassigned
        );
        assert!(store
            .get_by_id(theirs.id)
            .await
            .unwrap()
            .unwrap()
            .is_assigned_to("node-b"));
    }

    #[tokio::test]
    async fn test_release_node_tasks() {
        let store = Arc::new(InMemoryTaskStore::new());
        assigned_task(&store, 1, "node-a").await;
        assigned_task(&store, 2, "node-a").await;
        assigned_task(&store, 3, "node-b").await;
        let service = service(store.clone());

        let released = service
            .release_node_tasks(&CallerContext::node("node-a"), "node-a")
            .await
            .unwrap();
        assert_eq!(released, 2);
        assert_eq!(store.count(1, TaskStatus::Unassigned).await.unwrap(), 2);
        assert_eq!(store.count(1, TaskStatus::Assigned).await.unwrap(), 1);
    }
}
