//! 过滤器注册表
//!
//! 负责过滤器的生命周期：创建、启用/禁用、调整优先级、删除以及重置扫描进度。
//! 每次变更都会递增版本号并通知订阅者，优先级队列据此判断是否需要重新加载。

use std::sync::Arc;

use scheduler_core::{CallerContext, SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Filter, FilterTracker, NewFilter, TrackerStatus},
    repositories::FilterRepository,
};
use tokio::sync::watch;
use tracing::{debug, info};

pub struct FilterRegistry {
    repo: Arc<dyn FilterRepository>,
    version: watch::Sender<u64>,
}

impl FilterRegistry {
    pub fn new(repo: Arc<dyn FilterRepository>) -> Self {
        let (version, _) = watch::channel(0);
        Self { repo, version }
    }

    /// 订阅过滤器变更通知
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn notify_changed(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    pub async fn create(&self, ctx: &CallerContext, new_filter: NewFilter) -> SchedulerResult<Filter> {
        ctx.require_operator()?;
        Self::validate_new(&new_filter)?;

        let priority = if new_filter.auto_priority {
            self.resolve_auto_priority(&new_filter).await?
        } else {
            new_filter.priority
        };

        let filter = self
            .repo
            .create(&new_filter, priority, ctx.principal_name())
            .await?;
        self.notify_changed();

        info!(
            "创建{}, 处理器类型: {}, 优先级: {}, 创建者: {}",
            filter.entity_description(),
            filter.processor_kind,
            filter.priority,
            filter.run_as
        );
        Ok(filter)
    }

    fn validate_new(new_filter: &NewFilter) -> SchedulerResult<()> {
        if new_filter.name.trim().is_empty() {
            return Err(SchedulerError::InvalidParams("过滤器名称不能为空".to_string()));
        }
        if new_filter.processor_kind.trim().is_empty() {
            return Err(SchedulerError::InvalidParams("处理器类型不能为空".to_string()));
        }
        if let (Some(min), Some(max)) = (
            new_filter.min_meta_create_time,
            new_filter.max_meta_create_time,
        ) {
            if min >= max {
                return Err(SchedulerError::InvalidParams(format!(
                    "时间窗口无效: {min} 不早于 {max}"
                )));
            }
        }
        if new_filter.max_processing_tasks == Some(0) {
            return Err(SchedulerError::InvalidParams(
                "max_processing_tasks 必须大于 0".to_string(),
            ));
        }
        new_filter.expression.prepare_for_scan()?;
        Ok(())
    }

    /// 优先沿用同一处理器类型下已启用过滤器的优先级，其次是已禁用的，都没有则使用请求值
    async fn resolve_auto_priority(&self, new_filter: &NewFilter) -> SchedulerResult<i32> {
        let siblings: Vec<Filter> = self
            .repo
            .list()
            .await?
            .into_iter()
            .filter(|f| f.processor_kind == new_filter.processor_kind)
            .collect();

        let priority = siblings
            .iter()
            .find(|f| f.enabled)
            .or_else(|| siblings.iter().find(|f| !f.enabled))
            .map(|f| f.priority)
            .unwrap_or(new_filter.priority);

        debug!(
            "自动优先级: 处理器类型 {} 使用优先级 {}",
            new_filter.processor_kind, priority
        );
        Ok(priority)
    }

    pub async fn get(&self, ctx: &CallerContext, id: i64) -> SchedulerResult<Filter> {
        ctx.require_operator()?;
        self.load(id).await
    }

    async fn load(&self, id: i64) -> SchedulerResult<Filter> {
        self.repo
            .get_by_id(id)
            .await?
            .ok_or(SchedulerError::FilterNotFound { id })
    }

    pub async fn list(&self, ctx: &CallerContext) -> SchedulerResult<Vec<Filter>> {
        ctx.require_operator()?;
        self.repo.list().await
    }

    /// 供优先级队列加载
    pub async fn enabled_filters(&self) -> SchedulerResult<Vec<Filter>> {
        Ok(self
            .repo
            .list()
            .await?
            .into_iter()
            .filter(|f| f.enabled)
            .collect())
    }

    pub async fn set_enabled(
        &self,
        ctx: &CallerContext,
        id: i64,
        enabled: bool,
    ) -> SchedulerResult<Filter> {
        ctx.require_operator()?;
        let mut filter = self.load(id).await?;
        if filter.enabled == enabled {
            return Ok(filter);
        }
        filter.enabled = enabled;
        let filter = self.repo.update(&filter).await?;
        self.notify_changed();

        info!(
            "{}{}",
            filter.entity_description(),
            if enabled { " 已启用" } else { " 已禁用" }
        );
        Ok(filter)
    }

    pub async fn set_priority(
        &self,
        ctx: &CallerContext,
        id: i64,
        priority: i32,
    ) -> SchedulerResult<Filter> {
        ctx.require_operator()?;
        let mut filter = self.load(id).await?;
        filter.priority = priority;
        let filter = self.repo.update(&filter).await?;
        self.notify_changed();

        info!("{} 优先级调整为 {}", filter.entity_description(), priority);
        Ok(filter)
    }

    pub async fn set_max_processing_tasks(
        &self,
        ctx: &CallerContext,
        id: i64,
        max_processing_tasks: Option<u32>,
    ) -> SchedulerResult<Filter> {
        ctx.require_operator()?;
        if max_processing_tasks == Some(0) {
            return Err(SchedulerError::InvalidParams(
                "max_processing_tasks 必须大于 0".to_string(),
            ));
        }
        let mut filter = self.load(id).await?;
        filter.max_processing_tasks = max_processing_tasks;
        let filter = self.repo.update(&filter).await?;
        self.notify_changed();
        Ok(filter)
    }

    pub async fn delete(&self, ctx: &CallerContext, id: i64) -> SchedulerResult<()> {
        ctx.require_operator()?;
        if !self.repo.delete(id).await? {
            return Err(SchedulerError::FilterNotFound { id });
        }
        self.notify_changed();
        info!("删除过滤器 {}", id);
        Ok(())
    }

    pub async fn tracker(&self, ctx: &CallerContext, id: i64) -> SchedulerResult<FilterTracker> {
        ctx.require_operator()?;
        self.load(id).await?;
        self.repo.get_tracker(id).await
    }

    /// 清除错误或完成状态，扫描从原来的位置继续
    pub async fn reset_tracker(&self, ctx: &CallerContext, id: i64) -> SchedulerResult<FilterTracker> {
        ctx.require_operator()?;
        self.load(id).await?;

        let mut tracker = self.repo.get_tracker(id).await?;
        tracker.status = TrackerStatus::Created;
        tracker.message = None;
        self.repo.save_tracker(&tracker).await?;
        self.notify_changed();

        info!("过滤器 {} 的扫描进度已重置, 从元数据 {} 继续", id, tracker.min_meta_id);
        Ok(tracker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::expression::ExpressionOperator;
    use scheduler_infrastructure::InMemoryFilterRepository;
    use scheduler_testing_utils::FilterBuilder;

    fn registry() -> FilterRegistry {
        FilterRegistry::new(Arc::new(InMemoryFilterRepository::new()))
    }

    #[tokio::test]
    async fn test_create_bumps_version_and_records_owner() {
        let registry = registry();
        let ctx = CallerContext::user("alice");
        let mut changes = registry.subscribe();

        let filter = registry.create(&ctx, FilterBuilder::new().build()).await.unwrap();
        assert_eq!(filter.run_as, "alice");
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_unconstrained_expression() {
        let registry = registry();
        let result = registry
            .create(
                &CallerContext::user("alice"),
                FilterBuilder::new()
                    .with_expression(ExpressionOperator::and(vec![]))
                    .build(),
            )
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidExpression(_))));
    }

    #[tokio::test]
    async fn test_node_cannot_manage_filters() {
        let registry = registry();
        let result = registry
            .create(&CallerContext::node("node-a"), FilterBuilder::new().build())
            .await;
        assert!(matches!(result, Err(SchedulerError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_auto_priority_prefers_enabled_sibling() {
        let registry = registry();
        let ctx = CallerContext::user("alice");

        registry
            .create(
                &ctx,
                FilterBuilder::new()
                    .with_processor_kind("translate")
                    .with_priority(3)
                    .disabled()
                    .build(),
            )
            .await
            .unwrap();
        let auto = registry
            .create(
                &ctx,
                FilterBuilder::new()
                    .with_processor_kind("translate")
                    .with_priority(50)
                    .with_auto_priority()
                    .build(),
            )
            .await
            .unwrap();
        assert_eq!(auto.priority, 3);

        registry
            .create(
                &ctx,
                FilterBuilder::new()
                    .with_processor_kind("index")
                    .with_priority(8)
                    .build(),
            )
            .await
            .unwrap();
        let second_auto = registry
            .create(
                &ctx,
                FilterBuilder::new()
                    .with_processor_kind("translate")
                    .with_priority(99)
                    .with_auto_priority()
                    .build(),
            )
            .await
            .unwrap();
        // 已启用的同类过滤器优先
        assert_eq!(second_auto.priority, 3);

        let fresh = registry
            .create(
                &ctx,
                FilterBuilder::new()
                    .with_processor_kind("archive")
                    .with_priority(12)
                    .with_auto_priority()
                    .build(),
            )
            .await
            .unwrap();
        assert_eq!(fresh.priority, 12);
    }

    #[tokio::test]
    async fn test_lifecycle_operations() {
        let registry = registry();
        let ctx = CallerContext::user("alice");
        let filter = registry.create(&ctx, FilterBuilder::new().build()).await.unwrap();

        let disabled = registry.set_enabled(&ctx, filter.id, false).await.unwrap();
        assert!(!disabled.enabled);
        assert!(registry.enabled_filters().await.unwrap().is_empty());

        let reprioritised = registry.set_priority(&ctx, filter.id, 42).await.unwrap();
        assert_eq!(reprioritised.priority, 42);

        registry.delete(&ctx, filter.id).await.unwrap();
        assert!(matches!(
            registry.get(&ctx, filter.id).await,
            Err(SchedulerError::FilterNotFound { .. })
        ));
        assert!(registry.delete(&ctx, filter.id).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_tracker_keeps_progress() {
        let repo = Arc::new(InMemoryFilterRepository::new());
        let registry = FilterRegistry::new(repo.clone());
        let ctx = CallerContext::user("alice");
        let filter = registry.create(&ctx, FilterBuilder::new().build()).await.unwrap();

        let mut tracker = repo.get_tracker(filter.id).await.unwrap();
        tracker.min_meta_id = 77;
        tracker.mark_error("boom");
        repo.save_tracker(&tracker).await.unwrap();

        let reset = registry.reset_tracker(&ctx, filter.id).await.unwrap();
        assert_eq!(reset.status, TrackerStatus::Created);
        assert_eq!(reset.message, None);
        assert_eq!(reset.min_meta_id, 77);
    }
}
