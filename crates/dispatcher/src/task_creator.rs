//! 按过滤器创建任务
//!
//! 从过滤器的高水位开始扫描元数据，为每条命中的记录创建一个任务。
//! (过滤器, 元数据) 唯一约束保证重复扫描不会产生重复任务，所以中途失败或取消后
//! 下一轮从旧的高水位重扫是安全的。

use std::cmp::max;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use scheduler_core::{config::TuningHandle, CallerContext, SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Filter, FilterTracker, TaskStatus, TrackerStatus},
    expression::ExpressionOperator,
    repositories::{CreateOutcome, FilterRepository, MetaCriteria, MetaScan, MetaStore, TaskStore},
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};

use crate::progress_monitor::ProgressMonitor;

pub struct TaskCreator {
    filter_repo: Arc<dyn FilterRepository>,
    meta_store: Arc<dyn MetaStore>,
    task_store: Arc<dyn TaskStore>,
    tuning: TuningHandle,
    metrics: Arc<MetricsCollector>,
}

struct ScanResult {
    created: u64,
    duplicates: u64,
    last_processed: Option<i64>,
    cancelled: bool,
}

impl TaskCreator {
    pub fn new(
        filter_repo: Arc<dyn FilterRepository>,
        meta_store: Arc<dyn MetaStore>,
        task_store: Arc<dyn TaskStore>,
        tuning: TuningHandle,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            filter_repo,
            meta_store,
            task_store,
            tuning,
            metrics,
        }
    }

    /// 为一个过滤器创建最多 `max_to_create` 个任务，返回实际创建的数量
    ///
    /// 过滤器配置错误时把扫描进度标记为 ERROR 并返回 `InvalidFilter`，
    /// 调用方记录后继续处理其它过滤器。
    #[instrument(skip_all, fields(filter_id = filter.id))]
    pub async fn create_tasks_for_filter(
        &self,
        ctx: &CallerContext,
        filter: &Filter,
        progress: &ProgressMonitor,
        max_to_create: usize,
        total_created: &AtomicU64,
        cancel: &CancellationToken,
    ) -> SchedulerResult<u64> {
        ctx.require_processing()?;

        let started = Instant::now();
        progress.start_filter(filter);
        let result = self
            .create_for_filter(filter.id, progress, max_to_create, total_created, cancel)
            .await;
        if let Err(e) = &result {
            progress.record_error(filter.id, e.to_string());
        }
        progress.complete_filter(filter.id, started.elapsed());
        result
    }

    async fn create_for_filter(
        &self,
        filter_id: i64,
        progress: &ProgressMonitor,
        max_to_create: usize,
        total_created: &AtomicU64,
        cancel: &CancellationToken,
    ) -> SchedulerResult<u64> {
        // 队列中的副本可能已经过期
        let Some(filter) = self.filter_repo.get_by_id(filter_id).await? else {
            debug!("过滤器 {} 已被删除，跳过", filter_id);
            return Ok(0);
        };
        if !filter.enabled {
            debug!("{} 已禁用，跳过", filter.entity_description());
            return Ok(0);
        }

        let mut tracker = self.filter_repo.get_tracker(filter.id).await?;
        if !tracker.is_active() {
            debug!(
                "{} 的扫描状态为 {}，跳过",
                filter.entity_description(),
                tracker.status.as_str()
            );
            return Ok(0);
        }

        let expression = match Self::scan_expression(&filter) {
            Ok(expression) => expression,
            Err(message) => return Err(self.fail_filter(&filter, &mut tracker, message).await),
        };

        let tuning = self.tuning.snapshot().await;
        let unassigned = self.task_store.count(filter.id, TaskStatus::Unassigned).await?;
        self.metrics.update_unassigned_depth(filter.id, unassigned);

        let headroom = tuning.max_unassigned_per_filter.saturating_sub(unassigned);
        let limit = (max_to_create as u64).min(headroom) as usize;
        if limit == 0 {
            debug!(
                "{} 待分配任务 {} 个，本轮不再创建",
                filter.entity_description(),
                unassigned
            );
            progress.accumulate(filter.id, 0, 0);
            return Ok(0);
        }

        // 扫描前读取，扫描完后比它小的记录都已检查过
        let max_meta_id = self.meta_store.max_id().await?;
        let criteria = MetaCriteria {
            min_id: tracker.min_meta_id,
            min_create_time: filter.min_meta_create_time,
            max_create_time: filter.max_meta_create_time,
            max_matches: limit,
        };
        debug!(
            "扫描元数据, 过滤器: {}, 起始 ID: {}, 上限: {}, 身份: {}",
            filter.id, criteria.min_id, limit, filter.run_as
        );
        let scan = self.meta_store.scan(&expression, &criteria).await?;

        for failure in &scan.evaluation_errors {
            StructuredLogger::log_evaluation_error(filter.id, failure.meta_id, &failure.message);
        }

        let result = self.create_tasks(&filter, &scan, total_created, cancel).await?;
        self.advance_tracker(&filter, &mut tracker, &scan, &result, max_meta_id)
            .await?;

        let evaluation_errors = scan.evaluation_errors.len() as u64;
        progress.accumulate(filter.id, scan.examined, result.created);
        progress.record_duplicates(filter.id, result.duplicates);
        progress.record_evaluation_errors(filter.id, evaluation_errors);
        self.metrics.record_filter_scan(
            filter.id,
            result.created,
            result.duplicates,
            evaluation_errors,
        );
        self.metrics
            .update_unassigned_depth(filter.id, unassigned + result.created);

        if result.created > 0 {
            StructuredLogger::log_tasks_created(
                filter.id,
                &filter.name,
                result.created,
                scan.examined,
                tracker.min_meta_id,
            );
        }
        Ok(result.created)
    }

    /// 去掉状态条件后的表达式，以及时间窗口的检查
    fn scan_expression(filter: &Filter) -> Result<ExpressionOperator, String> {
        if let (Some(min), Some(max)) = (filter.min_meta_create_time, filter.max_meta_create_time) {
            if min >= max {
                return Err(format!("时间窗口无效: {min} 不早于 {max}"));
            }
        }
        filter.expression.prepare_for_scan().map_err(|e| e.to_string())
    }

    async fn fail_filter(
        &self,
        filter: &Filter,
        tracker: &mut FilterTracker,
        message: String,
    ) -> SchedulerError {
        tracker.mark_error(&message);
        if let Err(e) = self.filter_repo.save_tracker(tracker).await {
            warn!("保存过滤器 {} 的错误状态失败: {}", filter.id, e);
        }
        self.metrics.record_filter_error();
        StructuredLogger::log_filter_error(filter.id, &filter.name, &message);

        SchedulerError::InvalidFilter {
            id: filter.id,
            message,
        }
    }

    async fn create_tasks(
        &self,
        filter: &Filter,
        scan: &MetaScan,
        total_created: &AtomicU64,
        cancel: &CancellationToken,
    ) -> SchedulerResult<ScanResult> {
        let now = Utc::now();
        let mut result = ScanResult {
            created: 0,
            duplicates: 0,
            last_processed: None,
            cancelled: false,
        };

        for record in &scan.matches {
            if cancel.is_cancelled() {
                info!("任务创建被取消, {} 已创建 {} 个", filter.entity_description(), result.created);
                result.cancelled = true;
                break;
            }

            match self.task_store.create(filter.id, record.id, now).await? {
                CreateOutcome::Created(_) => {
                    result.created += 1;
                    total_created.fetch_add(1, Ordering::Relaxed);
                }
                CreateOutcome::Duplicate => result.duplicates += 1,
            }
            result.last_processed = Some(record.id);
        }

        Ok(result)
    }

    /// 推进高水位：
    /// - 达到上限时推进到最后检查的记录之后；
    /// - 扫描完所有候选时推进到扫描前的最大 ID 之后；
    /// - 被取消时只推进到最后处理的命中记录之后。
    async fn advance_tracker(
        &self,
        filter: &Filter,
        tracker: &mut FilterTracker,
        scan: &MetaScan,
        result: &ScanResult,
        max_meta_id: Option<i64>,
    ) -> SchedulerResult<()> {
        let high_water = if result.cancelled {
            result.last_processed
        } else if scan.exhausted {
            max(scan.last_examined_id, max_meta_id)
        } else {
            scan.last_examined_id
        };
        if let Some(id) = high_water {
            tracker.min_meta_id = max(tracker.min_meta_id, id + 1);
        }

        let now = Utc::now();
        tracker.last_poll_at = Some(now);
        tracker.last_poll_task_count = result.created;
        tracker.meta_count += result.created;

        if scan.exhausted && !result.cancelled && result.created == 0 && filter.window_closed(now) {
            tracker.status = TrackerStatus::Complete;
            info!("{} 的时间窗口已关闭且没有剩余记录，标记为完成", filter.entity_description());
        }

        match self.filter_repo.save_tracker(tracker).await {
            Ok(()) => Ok(()),
            Err(SchedulerError::FilterNotFound { .. }) => {
                debug!("过滤器 {} 在扫描期间被删除", filter.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use scheduler_core::config::SchedulerTuning;
    use scheduler_domain::expression::{ExpressionOperator, ExpressionTerm, fields, Condition};
    use scheduler_infrastructure::{InMemoryFilterRepository, InMemoryMetaStore, InMemoryTaskStore};
    use scheduler_testing_utils::{FilterBuilder, MetaRecordBuilder};

    struct Fixture {
        filters: Arc<InMemoryFilterRepository>,
        metas: Arc<InMemoryMetaStore>,
        tasks: Arc<InMemoryTaskStore>,
        creator: TaskCreator,
    }

    fn fixture(tuning: SchedulerTuning) -> Fixture {
        let filters = Arc::new(InMemoryFilterRepository::new());
        let metas = Arc::new(InMemoryMetaStore::new());
        let tasks = Arc::new(InMemoryTaskStore::new());
        let creator = TaskCreator::new(
            filters.clone(),
            metas.clone(),
            tasks.clone(),
            TuningHandle::new(tuning),
            Arc::new(MetricsCollector::new().unwrap()),
        );
        Fixture {
            filters,
            metas,
            tasks,
            creator,
        }
    }

    impl Fixture {
        async fn run(&self, filter: &Filter, max_to_create: usize) -> SchedulerResult<u64> {
            self.creator
                .create_tasks_for_filter(
                    &CallerContext::processing(),
                    filter,
                    &ProgressMonitor::new(),
                    max_to_create,
                    &AtomicU64::new(0),
                    &CancellationToken::new(),
                )
                .await
        }
    }

    #[tokio::test]
    async fn test_high_water_mark_advances_with_cap() {
        let f = fixture(SchedulerTuning::default());
        for _ in 0..25 {
            f.metas.append(MetaRecordBuilder::new().build()).unwrap();
        }
        let filter = f.filters.create(&FilterBuilder::new().build(), 10, "alice").await.unwrap();

        assert_eq!(f.run(&filter, 10).await.unwrap(), 10);
        assert_eq!(f.filters.get_tracker(filter.id).await.unwrap().min_meta_id, 11);

        assert_eq!(f.run(&filter, 10).await.unwrap(), 10);
        assert_eq!(f.run(&filter, 10).await.unwrap(), 5);
        let tracker = f.filters.get_tracker(filter.id).await.unwrap();
        assert_eq!(tracker.min_meta_id, 26);
        assert_eq!(tracker.meta_count, 25);
        assert_eq!(f.run(&filter, 10).await.unwrap(), 0);
        assert_eq!(f.tasks.all_tasks().unwrap().len(), 25);
    }

    #[tokio::test]
    async fn test_rescan_after_tracker_reset_creates_no_duplicates() {
        let f = fixture(SchedulerTuning::default());
        for _ in 0..5 {
            f.metas.append(MetaRecordBuilder::new().build()).unwrap();
        }
        let filter = f.filters.create(&FilterBuilder::new().build(), 10, "alice").await.unwrap();
        assert_eq!(f.run(&filter, 100).await.unwrap(), 5);

        f.filters.save_tracker(&FilterTracker::new(filter.id)).await.unwrap();
        assert_eq!(f.run(&filter, 100).await.unwrap(), 0);
        assert_eq!(f.tasks.all_tasks().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_unconstrained_filter_is_marked_error() {
        let f = fixture(SchedulerTuning::default());
        f.metas.append(MetaRecordBuilder::new().build()).unwrap();
        // 只有状态条件，去掉后没有任何约束
        let expression = ExpressionOperator::and(vec![
            ExpressionTerm::new(fields::STATUS, Condition::Equals, "Unlocked").into(),
        ]);
        let filter = f
            .filters
            .create(&FilterBuilder::new().with_expression(expression).build(), 10, "alice")
            .await
            .unwrap();

        let result = f.run(&filter, 100).await;
        assert!(matches!(result, Err(SchedulerError::InvalidFilter { .. })));

        let tracker = f.filters.get_tracker(filter.id).await.unwrap();
        assert_eq!(tracker.status, TrackerStatus::Error);
        assert!(tracker.message.is_some());
        assert!(f.tasks.all_tasks().unwrap().is_empty());

        // 出错的过滤器不再扫描
        assert_eq!(f.run(&filter, 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backlog_limit_caps_creation() {
        let f = fixture(SchedulerTuning {
            max_unassigned_per_filter: 3,
            ..Default::default()
        });
        for _ in 0..10 {
            f.metas.append(MetaRecordBuilder::new().build()).unwrap();
        }
        let filter = f.filters.create(&FilterBuilder::new().build(), 10, "alice").await.unwrap();

        assert_eq!(f.run(&filter, 100).await.unwrap(), 3);
        assert_eq!(f.run(&filter, 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_window_marks_tracker_complete() {
        let f = fixture(SchedulerTuning::default());
        let now = Utc::now();
        f.metas
            .append(MetaRecordBuilder::new().with_create_time(now - Duration::hours(2)).build())
            .unwrap();
        let filter = f
            .filters
            .create(
                &FilterBuilder::new()
                    .with_window(Some(now - Duration::hours(3)), Some(now - Duration::hours(1)))
                    .build(),
                10,
                "alice",
            )
            .await
            .unwrap();

        assert_eq!(f.run(&filter, 100).await.unwrap(), 1);
        assert_eq!(f.filters.get_tracker(filter.id).await.unwrap().status, TrackerStatus::Created);

        assert_eq!(f.run(&filter, 100).await.unwrap(), 0);
        assert_eq!(f.filters.get_tracker(filter.id).await.unwrap().status, TrackerStatus::Complete);
    }

    #[tokio::test]
    async fn test_cancelled_scan_creates_nothing() {
        let f = fixture(SchedulerTuning::default());
        for _ in 0..5 {
            f.metas.append(MetaRecordBuilder::new().build()).unwrap();
        }
        let filter = f.filters.create(&FilterBuilder::new().build(), 10, "alice").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let created = f
            .creator
            .create_tasks_for_filter(
                &CallerContext::processing(),
                &filter,
                &ProgressMonitor::new(),
                100,
                &AtomicU64::new(0),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(created, 0);
        assert_eq!(f.filters.get_tracker(filter.id).await.unwrap().min_meta_id, 0);
    }

    #[tokio::test]
    async fn test_requires_processing_principal() {
        let f = fixture(SchedulerTuning::default());
        let filter = f.filters.create(&FilterBuilder::new().build(), 10, "alice").await.unwrap();
        let result = f
            .creator
            .create_tasks_for_filter(
                &CallerContext::user("alice"),
                &filter,
                &ProgressMonitor::new(),
                10,
                &AtomicU64::new(0),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(SchedulerError::PermissionDenied(_))));
    }
}
