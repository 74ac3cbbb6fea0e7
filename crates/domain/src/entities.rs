use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::expression::ExpressionOperator;

/// 处理过滤器
///
/// 持久化的选择规则：哪些元数据记录需要交给哪一类处理器处理，以及优先级。
///
/// # 字段说明
///
/// - `priority`: 数值越大越优先
/// - `auto_priority`: 创建时沿用同一处理器类型下已有过滤器的优先级
/// - `min_meta_create_time` / `max_meta_create_time`: 记录创建时间窗口，左闭右开
/// - `max_processing_tasks`: 同时处于已分配状态的任务上限，不设置则不限
/// - `run_as`: 创建过滤器的用户，任务创建时以该身份记录日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub expression: ExpressionOperator,
    pub priority: i32,
    pub auto_priority: bool,
    pub enabled: bool,
    pub processor_kind: String,
    pub min_meta_create_time: Option<DateTime<Utc>>,
    pub max_meta_create_time: Option<DateTime<Utc>>,
    pub max_processing_tasks: Option<u32>,
    pub run_as: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Filter {
    /// 有上界的过滤器在时间窗口关闭后不会再有新记录
    pub fn window_closed(&self, now: DateTime<Utc>) -> bool {
        self.max_meta_create_time.is_some_and(|max| max <= now)
    }

    pub fn entity_description(&self) -> String {
        format!("过滤器 '{}' (ID: {})", self.name, self.id)
    }
}

/// 新建过滤器的参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFilter {
    pub name: String,
    pub expression: ExpressionOperator,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub auto_priority: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub processor_kind: String,
    #[serde(default)]
    pub min_meta_create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_meta_create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_processing_tasks: Option<u32>,
}

pub const DEFAULT_PRIORITY: i32 = 10;

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerStatus {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "ERROR")]
    Error,
}

impl TrackerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerStatus::Created => "CREATED",
            TrackerStatus::Complete => "COMPLETE",
            TrackerStatus::Error => "ERROR",
        }
    }
}

impl FromStr for TrackerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(TrackerStatus::Created),
            "COMPLETE" => Ok(TrackerStatus::Complete),
            "ERROR" => Ok(TrackerStatus::Error),
            _ => Err(format!("无效的跟踪状态: {s}")),
        }
    }
}

const TRACKER_MESSAGE_LIMIT: usize = 200;

/// 过滤器扫描进度，与过滤器本身分开保存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterTracker {
    pub filter_id: i64,
    /// 下一轮扫描从这个元数据 ID 开始
    pub min_meta_id: i64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_poll_task_count: u64,
    /// 累计创建的任务数
    pub meta_count: u64,
    pub status: TrackerStatus,
    pub message: Option<String>,
}

impl FilterTracker {
    pub fn new(filter_id: i64) -> Self {
        Self {
            filter_id,
            min_meta_id: 0,
            last_poll_at: None,
            last_poll_task_count: 0,
            meta_count: 0,
            status: TrackerStatus::Created,
            message: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TrackerStatus::Created
    }

    pub fn mark_error(&mut self, message: &str) {
        self.status = TrackerStatus::Error;
        self.message = Some(message.chars().take(TRACKER_MESSAGE_LIMIT).collect());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaStatus {
    #[serde(rename = "UNLOCKED")]
    Unlocked,
    #[serde(rename = "LOCKED")]
    Locked,
    #[serde(rename = "DELETED")]
    Deleted,
}

impl MetaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaStatus::Unlocked => "UNLOCKED",
            MetaStatus::Locked => "LOCKED",
            MetaStatus::Deleted => "DELETED",
        }
    }

    /// 已删除的记录永远不会被选中
    pub fn is_selectable(&self) -> bool {
        !matches!(self, MetaStatus::Deleted)
    }
}

impl FromStr for MetaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNLOCKED" => Ok(MetaStatus::Unlocked),
            "LOCKED" => Ok(MetaStatus::Locked),
            "DELETED" => Ok(MetaStatus::Deleted),
            _ => Err(format!("无效的元数据状态: {s}")),
        }
    }
}

/// 元数据记录，由外部写入，调度器只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub id: i64,
    pub feed_name: String,
    pub type_name: String,
    pub status: MetaStatus,
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// 待写入的元数据记录，ID 由存储分配
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMetaRecord {
    pub feed_name: String,
    pub type_name: String,
    pub status: MetaStatus,
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl MetaRecord {
    pub fn from_new(id: i64, record: NewMetaRecord) -> Self {
        Self {
            id,
            feed_name: record.feed_name,
            type_name: record.type_name,
            status: record.status,
            create_time: record.create_time,
            attributes: record.attributes,
        }
    }

    /// 时间窗口左闭右开
    pub fn in_window(&self, min: Option<DateTime<Utc>>, max: Option<DateTime<Utc>>) -> bool {
        min.map_or(true, |min| self.create_time >= min)
            && max.map_or(true, |max| self.create_time < max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "UNASSIGNED")]
    Unassigned,
    #[serde(rename = "ASSIGNED")]
    Assigned,
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "FAILED")]
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Unassigned => "UNASSIGNED",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNASSIGNED" => Ok(TaskStatus::Unassigned),
            "ASSIGNED" => Ok(TaskStatus::Assigned),
            "COMPLETE" => Ok(TaskStatus::Complete),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(format!("无效的任务状态: {s}")),
        }
    }
}

/// 处理任务
///
/// 一个 (过滤器, 元数据记录) 组合对应一个任务。`version` 在每次状态变化时加一，
/// 所有状态变化都以观察到的版本号做比较交换。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub filter_id: i64,
    pub meta_id: i64,
    pub status: TaskStatus,
    pub node_name: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub status_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub records_read: u64,
    pub records_written: u64,
    pub error_markers: Vec<String>,
}

impl Task {
    pub fn new(id: i64, filter_id: i64, meta_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            filter_id,
            meta_id,
            status: TaskStatus::Unassigned,
            node_name: None,
            version: 0,
            created_at: now,
            status_at: now,
            assigned_at: None,
            records_read: 0,
            records_written: 0,
            error_markers: Vec::new(),
        }
    }

    pub fn is_assigned_to(&self, node_name: &str) -> bool {
        self.status == TaskStatus::Assigned && self.node_name.as_deref() == Some(node_name)
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (过滤器: {}, 元数据: {})",
            self.id, self.filter_id, self.meta_id
        )
    }
}

/// 节点汇报的处理统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStats {
    #[serde(default)]
    pub records_read: u64,
    #[serde(default)]
    pub records_written: u64,
    #[serde(default)]
    pub error_markers: Vec<String>,
}

/// 任务状态迁移
///
/// ```text
/// UNASSIGNED --Assign--> ASSIGNED --Complete--> COMPLETE
///                           |  \----Fail------> FAILED
///                           \------Release----> UNASSIGNED
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    Assign {
        node_name: String,
        at: DateTime<Utc>,
    },
    Release {
        at: DateTime<Utc>,
    },
    Complete {
        at: DateTime<Utc>,
        stats: OutcomeStats,
    },
    Fail {
        at: DateTime<Utc>,
        stats: OutcomeStats,
    },
}

impl TaskTransition {
    pub fn from_status(&self) -> TaskStatus {
        match self {
            TaskTransition::Assign { .. } => TaskStatus::Unassigned,
            _ => TaskStatus::Assigned,
        }
    }

    pub fn to_status(&self) -> TaskStatus {
        match self {
            TaskTransition::Assign { .. } => TaskStatus::Assigned,
            TaskTransition::Release { .. } => TaskStatus::Unassigned,
            TaskTransition::Complete { .. } => TaskStatus::Complete,
            TaskTransition::Fail { .. } => TaskStatus::Failed,
        }
    }

    /// 基于观察到的任务计算迁移后的任务，状态不匹配时返回 None
    pub fn apply(&self, observed: &Task) -> Option<Task> {
        if observed.status != self.from_status() {
            return None;
        }

        let mut next = observed.clone();
        next.status = self.to_status();
        next.version = observed.version + 1;

        match self {
            TaskTransition::Assign { node_name, at } => {
                next.node_name = Some(node_name.clone());
                next.assigned_at = Some(*at);
                next.status_at = *at;
            }
            TaskTransition::Release { at } => {
                next.node_name = None;
                next.assigned_at = None;
                next.status_at = *at;
            }
            TaskTransition::Complete { at, stats } | TaskTransition::Fail { at, stats } => {
                next.status_at = *at;
                next.records_read = stats.records_read;
                next.records_written = stats.records_written;
                next.error_markers = stats.error_markers.clone();
            }
        }
        Some(next)
    }
}

/// 分配给节点的任务句柄
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: i64,
    pub filter_id: i64,
    pub meta_id: i64,
    pub processor_kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "FAILED")]
    Failed,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Complete => "COMPLETE",
            TaskOutcome::Failed => "FAILED",
        }
    }
}

/// 节点汇报的任务结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub task_id: i64,
    pub node_name: String,
    pub outcome: TaskOutcome,
    #[serde(flatten)]
    pub stats: OutcomeStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_then_complete() {
        let now = Utc::now();
        let task = Task::new(1, 10, 100, now);

        let assigned = TaskTransition::Assign {
            node_name: "node-a".to_string(),
            at: now,
        }
        .apply(&task)
        .unwrap();
        assert_eq!(assigned.status, TaskStatus::Assigned);
        assert_eq!(assigned.version, 1);
        assert!(assigned.is_assigned_to("node-a"));

        let complete = TaskTransition::Complete {
            at: now,
            stats: OutcomeStats {
                records_read: 5,
                records_written: 4,
                error_markers: vec![],
            },
        }
        .apply(&assigned)
        .unwrap();
        assert_eq!(complete.status, TaskStatus::Complete);
        assert_eq!(complete.records_read, 5);
        assert_eq!(complete.version, 2);
        assert!(complete.status.is_terminal());
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let now = Utc::now();
        let task = Task::new(1, 10, 100, now);

        assert!(TaskTransition::Release { at: now }.apply(&task).is_none());
        assert!(TaskTransition::Complete {
            at: now,
            stats: OutcomeStats::default()
        }
        .apply(&task)
        .is_none());

        let mut failed = task.clone();
        failed.status = TaskStatus::Failed;
        assert!(TaskTransition::Assign {
            node_name: "n".to_string(),
            at: now
        }
        .apply(&failed)
        .is_none());
    }

    #[test]
    fn test_release_clears_assignment() {
        let now = Utc::now();
        let task = Task::new(1, 10, 100, now);
        let assigned = TaskTransition::Assign {
            node_name: "node-a".to_string(),
            at: now,
        }
        .apply(&task)
        .unwrap();

        let released = TaskTransition::Release { at: now }.apply(&assigned).unwrap();
        assert_eq!(released.status, TaskStatus::Unassigned);
        assert_eq!(released.node_name, None);
        assert_eq!(released.assigned_at, None);
    }

    #[test]
    fn test_tracker_error_message_is_truncated() {
        let mut tracker = FilterTracker::new(1);
        assert!(tracker.is_active());

        tracker.mark_error(&"x".repeat(500));
        assert_eq!(tracker.status, TrackerStatus::Error);
        assert_eq!(tracker.message.as_ref().unwrap().len(), 200);
        assert!(!tracker.is_active());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!("ASSIGNED".parse::<TaskStatus>().unwrap(), TaskStatus::Assigned);
        assert!("BOGUS".parse::<TaskStatus>().is_err());
        assert_eq!(MetaStatus::Locked.as_str(), "LOCKED");
        assert!(!MetaStatus::Deleted.is_selectable());
        assert_eq!("ERROR".parse::<TrackerStatus>().unwrap(), TrackerStatus::Error);
    }

    #[test]
    fn test_outcome_report_json_is_flat() {
        let report: OutcomeReport = serde_json::from_str(
            r#"{"task_id": 3, "node_name": "n1", "outcome": "FAILED", "error_markers": ["boom"]}"#,
        )
        .unwrap();
        assert_eq!(report.outcome, TaskOutcome::Failed);
        assert_eq!(report.stats.error_markers, vec!["boom".to_string()]);
        assert_eq!(report.stats.records_read, 0);
    }
}
