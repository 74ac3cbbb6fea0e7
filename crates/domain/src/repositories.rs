//! 领域仓储抽象
//!
//! 调度器只通过这里定义的窄接口访问存储：过滤器及其扫描进度、只读的元数据、
//! 以及可变的任务表。任务状态的每一次变化都是一次比较交换，多个调度器实例
//! 共享同一个存储时依赖它保证同一任务不会被重复分配。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::SchedulerResult;

use crate::entities::{Filter, FilterTracker, MetaRecord, NewFilter, Task, TaskStatus, TaskTransition};
use crate::expression::{ExpressionError, ExpressionOperator};

/// 过滤器仓储
#[async_trait]
pub trait FilterRepository: Send + Sync {
    async fn create(&self, filter: &NewFilter, priority: i32, run_as: &str) -> SchedulerResult<Filter>;
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Filter>>;
    /// 按 ID 升序返回全部过滤器
    async fn list(&self) -> SchedulerResult<Vec<Filter>>;
    async fn update(&self, filter: &Filter) -> SchedulerResult<Filter>;
    /// 同时删除扫描进度
    async fn delete(&self, id: i64) -> SchedulerResult<bool>;
    /// 不存在时返回初始进度
    async fn get_tracker(&self, filter_id: i64) -> SchedulerResult<FilterTracker>;
    async fn save_tracker(&self, tracker: &FilterTracker) -> SchedulerResult<()>;
}

/// 元数据扫描条件
///
/// 记录按 ID 升序检查，已删除的记录永远不会返回。
#[derive(Debug, Clone)]
pub struct MetaCriteria {
    pub min_id: i64,
    /// 包含
    pub min_create_time: Option<DateTime<Utc>>,
    /// 不包含
    pub max_create_time: Option<DateTime<Utc>>,
    pub max_matches: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationFailure {
    pub meta_id: i64,
    pub message: String,
}

/// 一次扫描的结果
#[derive(Debug, Clone, Default)]
pub struct MetaScan {
    pub matches: Vec<MetaRecord>,
    pub examined: u64,
    pub last_examined_id: Option<i64>,
    pub evaluation_errors: Vec<EvaluationFailure>,
    /// 没有达到命中上限就检查完了所有候选记录
    pub exhausted: bool,
}

impl MetaScan {
    pub fn new() -> Self {
        Self::default()
    }

    /// 检查一条候选记录，返回是否已经达到命中上限
    pub fn offer(
        &mut self,
        record: MetaRecord,
        expression: &ExpressionOperator,
        criteria: &MetaCriteria,
    ) -> bool {
        if self.is_full(criteria) {
            return true;
        }

        self.examined += 1;
        self.last_examined_id = Some(record.id);

        match expression.matches(&record) {
            Ok(true) => self.matches.push(record),
            Ok(false) => {}
            Err(ExpressionError::Evaluation { meta_id, message, .. }) => {
                self.evaluation_errors.push(EvaluationFailure { meta_id, message });
            }
            Err(e) => {
                self.evaluation_errors.push(EvaluationFailure {
                    meta_id: record.id,
                    message: e.to_string(),
                });
            }
        }

        self.is_full(criteria)
    }

    /// 记录无法读取时计为已检查并跳过，返回是否已经达到命中上限
    pub fn skip_unreadable(
        &mut self,
        meta_id: i64,
        message: impl Into<String>,
        criteria: &MetaCriteria,
    ) -> bool {
        if self.is_full(criteria) {
            return true;
        }

        self.examined += 1;
        self.last_examined_id = Some(meta_id);
        self.evaluation_errors.push(EvaluationFailure {
            meta_id,
            message: message.into(),
        });
        false
    }

    pub fn is_full(&self, criteria: &MetaCriteria) -> bool {
        self.matches.len() >= criteria.max_matches
    }

    /// 候选记录用完后调用
    pub fn finish(mut self, criteria: &MetaCriteria) -> Self {
        self.exhausted = !self.is_full(criteria);
        self
    }
}

/// 元数据存储，调度器只读
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn scan(
        &self,
        expression: &ExpressionOperator,
        criteria: &MetaCriteria,
    ) -> SchedulerResult<MetaScan>;
    async fn max_id(&self) -> SchedulerResult<Option<i64>>;
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<MetaRecord>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Task),
    /// 该 (过滤器, 元数据) 组合已经有任务
    Duplicate,
}

/// 任务查询条件，结果按任务 ID 升序
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub filter_id: Option<i64>,
    pub status: Option<TaskStatus>,
    pub node_name: Option<String>,
    /// 只返回分配时间早于该时刻的任务
    pub assigned_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn unassigned_for_filter(filter_id: i64, limit: usize) -> Self {
        Self {
            filter_id: Some(filter_id),
            status: Some(TaskStatus::Unassigned),
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn assigned_to_node(node_name: &str) -> Self {
        Self {
            status: Some(TaskStatus::Assigned),
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }
    }

    pub fn assigned_before(cutoff: DateTime<Utc>, limit: usize) -> Self {
        Self {
            status: Some(TaskStatus::Assigned),
            assigned_before: Some(cutoff),
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// 内存实现和测试使用的匹配逻辑
    pub fn matches(&self, task: &Task) -> bool {
        if self.filter_id.is_some_and(|id| id != task.filter_id) {
            return false;
        }
        if self.status.is_some_and(|s| s != task.status) {
            return false;
        }
        if let Some(node) = &self.node_name {
            if task.node_name.as_deref() != Some(node.as_str()) {
                return false;
            }
        }
        if let Some(cutoff) = self.assigned_before {
            match task.assigned_at {
                Some(at) if at < cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

/// 任务存储
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 原子地创建任务，(filter_id, meta_id) 已存在时返回 Duplicate
    async fn create(
        &self,
        filter_id: i64,
        meta_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<CreateOutcome>;
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>>;
    async fn find(&self, query: &TaskQuery) -> SchedulerResult<Vec<Task>>;
    async fn count(&self, filter_id: i64, status: TaskStatus) -> SchedulerResult<u64>;
    /// 仅当存储中的任务仍是 `observed` 的版本时才应用迁移。
    /// 竞争失败返回 `Ok(None)`，迁移本身不合法返回 `TaskStateConflict`。
    async fn compare_and_swap(
        &self,
        observed: &Task,
        transition: &TaskTransition,
    ) -> SchedulerResult<Option<Task>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::MetaStatus;
    use crate::expression::{fields, Condition, ExpressionTerm};
    use std::collections::BTreeMap;

    fn record(id: i64, feed: &str) -> MetaRecord {
        MetaRecord {
            id,
            feed_name: feed.to_string(),
            type_name: "Raw".to_string(),
            status: MetaStatus::Unlocked,
            create_time: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_scan_stops_at_max_matches() {
        let expr = ExpressionOperator::and(vec![
            ExpressionTerm::new(fields::FEED, Condition::Equals, "A").into()
        ]);
        let criteria = MetaCriteria {
            min_id: 0,
            min_create_time: None,
            max_create_time: None,
            max_matches: 2,
        };

        let mut scan = MetaScan::new();
        assert!(!scan.offer(record(1, "A"), &expr, &criteria));
        assert!(!scan.offer(record(2, "B"), &expr, &criteria));
        assert!(scan.offer(record(3, "A"), &expr, &criteria));
        assert!(scan.offer(record(4, "A"), &expr, &criteria));

        let scan = scan.finish(&criteria);
        assert_eq!(scan.matches.len(), 2);
        assert_eq!(scan.examined, 3);
        assert_eq!(scan.last_examined_id, Some(3));
        assert!(!scan.exhausted);
    }

    #[test]
    fn test_unreadable_record_counted_as_examined() {
        let expr = ExpressionOperator::and(vec![
            ExpressionTerm::new(fields::FEED, Condition::Equals, "A").into()
        ]);
        let criteria = MetaCriteria {
            min_id: 0,
            min_create_time: None,
            max_create_time: None,
            max_matches: 1,
        };

        let mut scan = MetaScan::new();
        assert!(!scan.skip_unreadable(1, "属性无法解析", &criteria));
        assert!(scan.offer(record(2, "A"), &expr, &criteria));
        assert!(scan.skip_unreadable(3, "属性无法解析", &criteria));

        let scan = scan.finish(&criteria);
        assert_eq!(scan.examined, 2);
        assert_eq!(scan.last_examined_id, Some(2));
        assert_eq!(scan.evaluation_errors.len(), 1);
        assert_eq!(scan.evaluation_errors[0].meta_id, 1);
    }

    #[test]
    fn test_task_query_matching() {
        let now = Utc::now();
        let mut task = Task::new(1, 7, 70, now);
        assert!(TaskQuery::unassigned_for_filter(7, 10).matches(&task));
        assert!(!TaskQuery::unassigned_for_filter(8, 10).matches(&task));

        task.status = TaskStatus::Assigned;
        task.node_name = Some("n1".to_string());
        task.assigned_at = Some(now - chrono::Duration::minutes(20));
        assert!(TaskQuery::assigned_to_node("n1").matches(&task));
        assert!(!TaskQuery::assigned_to_node("n2").matches(&task));
        assert!(TaskQuery::assigned_before(now - chrono::Duration::minutes(10), 10).matches(&task));
        assert!(!TaskQuery::assigned_before(now - chrono::Duration::minutes(30), 10).matches(&task));
    }
}
