use std::sync::Arc;

use scheduler_core::config::{DispatcherConfig, TuningHandle};
use scheduler_domain::repositories::{FilterRepository, MetaStore, TaskStore};
use scheduler_infrastructure::MetricsCollector;

use crate::controller::TaskCreationController;
use crate::filter_queue::FilterPriorityQueue;
use crate::filter_registry::FilterRegistry;
use crate::outcome_service::TaskOutcomeService;
use crate::reclaim_service::TaskReclaimService;
use crate::task_creator::TaskCreator;
use crate::task_fetcher::TaskFetcher;

/// 调度器的全部组件，共享同一组存储和运行参数
#[derive(Clone)]
pub struct DispatcherComponents {
    pub registry: Arc<FilterRegistry>,
    pub queue: Arc<FilterPriorityQueue>,
    pub controller: Arc<TaskCreationController>,
    pub fetcher: Arc<TaskFetcher>,
    pub outcomes: Arc<TaskOutcomeService>,
    pub reclaimer: Arc<TaskReclaimService>,
    pub task_store: Arc<dyn TaskStore>,
    pub tuning: TuningHandle,
}

impl DispatcherComponents {
    pub fn build(
        filter_repo: Arc<dyn FilterRepository>,
        meta_store: Arc<dyn MetaStore>,
        task_store: Arc<dyn TaskStore>,
        tuning: TuningHandle,
        metrics: Arc<MetricsCollector>,
        config: &DispatcherConfig,
    ) -> Self {
        let registry = Arc::new(FilterRegistry::new(filter_repo.clone()));
        let queue = Arc::new(FilterPriorityQueue::new(registry.clone(), tuning.clone()));
        let creator = Arc::new(TaskCreator::new(
            filter_repo,
            meta_store,
            task_store.clone(),
            tuning.clone(),
            metrics.clone(),
        ));
        let controller = Arc::new(TaskCreationController::new(
            creator,
            queue.clone(),
            tuning.clone(),
            metrics.clone(),
            config.creation_concurrency,
        ));
        let fetcher = Arc::new(TaskFetcher::new(
            task_store.clone(),
            queue.clone(),
            tuning.clone(),
            metrics.clone(),
        ));
        let outcomes = Arc::new(TaskOutcomeService::new(task_store.clone(), metrics.clone()));
        let reclaimer = Arc::new(TaskReclaimService::new(
            task_store.clone(),
            tuning.clone(),
            metrics,
            None,
        ));

        Self {
            registry,
            queue,
            controller,
            fetcher,
            outcomes,
            reclaimer,
            task_store,
            tuning,
        }
    }
}
