//! 任务创建控制器
//!
//! 一轮任务创建按优先级访问过滤器，由若干个工作者共享同一个待处理队列。
//! 同一时刻最多只有一轮在执行，并发触发的请求直接返回。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use scheduler_core::{
    config::{SchedulerTuning, TuningHandle},
    CallerContext, SchedulerResult,
};
use scheduler_domain::entities::Filter;
use scheduler_infrastructure::MetricsCollector;

use crate::filter_queue::FilterPriorityQueue;
use crate::progress_monitor::{ProgressMonitor, ProgressSummary};
use crate::task_creator::TaskCreator;

#[derive(Debug, Clone, Serialize)]
pub struct CreationPassReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub filters_visited: usize,
    pub tasks_created: u64,
    pub cancelled: bool,
    pub progress: ProgressSummary,
}

struct PassState<'a> {
    ctx: &'a CallerContext,
    tuning: &'a SchedulerTuning,
    pending: StdMutex<VecDeque<Filter>>,
    progress: ProgressMonitor,
    total_created: AtomicU64,
    visited: AtomicUsize,
    cancel: &'a CancellationToken,
}

impl PassState<'_> {
    /// 本轮剩余的创建配额
    fn remaining_budget(&self) -> usize {
        match self.tuning.max_tasks_per_pass {
            Some(budget) => {
                budget.saturating_sub(self.total_created.load(Ordering::Relaxed) as usize)
            }
            None => usize::MAX,
        }
    }

    fn next_filter(&self) -> Option<Filter> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.pop_front()
    }
}

pub struct TaskCreationController {
    creator: Arc<TaskCreator>,
    queue: Arc<FilterPriorityQueue>,
    tuning: TuningHandle,
    metrics: Arc<MetricsCollector>,
    concurrency: usize,
    pass_lock: Mutex<()>,
    last_report: RwLock<Option<CreationPassReport>>,
}

impl TaskCreationController {
    pub fn new(
        creator: Arc<TaskCreator>,
        queue: Arc<FilterPriorityQueue>,
        tuning: TuningHandle,
        metrics: Arc<MetricsCollector>,
        concurrency: usize,
    ) -> Self {
        Self {
            creator,
            queue,
            tuning,
            metrics,
            concurrency: concurrency.max(1),
            pass_lock: Mutex::new(()),
            last_report: RwLock::new(None),
        }
    }

    /// 执行一轮任务创建
    ///
    /// 已有一轮在执行时返回 `Ok(None)`。
    #[instrument(skip_all)]
    pub async fn create_tasks(
        &self,
        ctx: &CallerContext,
        cancel: &CancellationToken,
    ) -> SchedulerResult<Option<CreationPassReport>> {
        ctx.require_processing()?;

        let Ok(_guard) = self.pass_lock.try_lock() else {
            info!("已有一轮任务创建正在执行，跳过本次请求");
            return Ok(None);
        };

        let started = Instant::now();
        let started_at = Utc::now();
        let tuning = self.tuning.snapshot().await;
        let filters = self.queue.next_filters(started_at).await?;
        debug!("本轮候选过滤器 {} 个", filters.len());

        let pass = PassState {
            ctx,
            tuning: &tuning,
            pending: StdMutex::new(VecDeque::from(filters)),
            progress: ProgressMonitor::new(),
            total_created: AtomicU64::new(0),
            visited: AtomicUsize::new(0),
            cancel,
        };

        join_all((0..self.concurrency).map(|_| self.drain(&pass))).await;

        let tasks_created = pass.total_created.load(Ordering::Relaxed);
        let duration = started.elapsed();
        self.metrics
            .record_creation_pass(tasks_created, duration.as_secs_f64());
        pass.progress.report();

        let report = CreationPassReport {
            started_at,
            duration_ms: duration.as_millis() as u64,
            filters_visited: pass.visited.load(Ordering::Relaxed),
            tasks_created,
            cancelled: cancel.is_cancelled(),
            progress: pass.progress.summary(),
        };
        *self.last_report.write().await = Some(report.clone());
        Ok(Some(report))
    }

    async fn drain(&self, pass: &PassState<'_>) {
        loop {
            if pass.cancel.is_cancelled() {
                break;
            }
            let budget = pass.remaining_budget();
            if budget == 0 {
                debug!("本轮任务创建配额已用完");
                break;
            }
            let Some(filter) = pass.next_filter() else {
                break;
            };
            pass.visited.fetch_add(1, Ordering::Relaxed);

            let max_to_create = pass.tuning.queue_size_cap.min(budget);
            let created = match self
                .creator
                .create_tasks_for_filter(
                    pass.ctx,
                    &filter,
                    &pass.progress,
                    max_to_create,
                    &pass.total_created,
                    pass.cancel,
                )
                .await
            {
                Ok(created) => created,
                Err(e) => {
                    warn!("{} 创建任务失败: {}", filter.entity_description(), e);
                    0
                }
            };
            self.queue.record_scan(filter.id, created, Utc::now()).await;
        }
    }

    pub async fn last_report(&self) -> Option<CreationPassReport> {
        self.last_report.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }
}
