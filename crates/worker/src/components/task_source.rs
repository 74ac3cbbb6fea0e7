use async_trait::async_trait;

use scheduler_core::{CallerContext, SchedulerResult};
use scheduler_dispatcher::DispatcherComponents;
use scheduler_domain::entities::{OutcomeReport, TaskHandle};

/// 节点领取和汇报任务的通道
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn assign_tasks(&self, node_name: &str, max_count: i64) -> SchedulerResult<Vec<TaskHandle>>;

    async fn report_outcome(&self, report: &OutcomeReport) -> SchedulerResult<()>;

    async fn abandon_tasks(&self, node_name: &str, task_ids: &[i64]) -> SchedulerResult<usize>;

    async fn release_node_tasks(&self, node_name: &str) -> SchedulerResult<usize>;
}

/// 与调度器运行在同一进程内
pub struct LocalTaskSource {
    dispatcher: DispatcherComponents,
}

impl LocalTaskSource {
    pub fn new(dispatcher: DispatcherComponents) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl TaskSource for LocalTaskSource {
    async fn assign_tasks(&self, node_name: &str, max_count: i64) -> SchedulerResult<Vec<TaskHandle>> {
        self.dispatcher
            .fetcher
            .assign_tasks(&CallerContext::node(node_name), node_name, max_count)
            .await
    }

    async fn report_outcome(&self, report: &OutcomeReport) -> SchedulerResult<()> {
        self.dispatcher
            .outcomes
            .report_outcome(&CallerContext::node(report.node_name.clone()), report)
            .await
            .map(|_| ())
    }

    async fn abandon_tasks(&self, node_name: &str, task_ids: &[i64]) -> SchedulerResult<usize> {
        self.dispatcher
            .outcomes
            .abandon_tasks(&CallerContext::node(node_name), node_name, task_ids)
            .await
    }

    async fn release_node_tasks(&self, node_name: &str) -> SchedulerResult<usize> {
        self.dispatcher
            .outcomes
            .release_node_tasks(&CallerContext::node(node_name), node_name)
            .await
    }
}
