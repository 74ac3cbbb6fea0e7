//! Test data builders for creating test entities
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use chrono::{DateTime, Utc};
use scheduler_domain::entities::{
    Filter, MetaStatus, NewFilter, NewMetaRecord, Task, TaskStatus, DEFAULT_PRIORITY,
};
use scheduler_domain::expression::ExpressionOperator;
use std::collections::BTreeMap;

use crate::helpers::feed_expression;

/// Builder for filter creation requests
pub struct FilterBuilder {
    filter: NewFilter,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self {
            filter: NewFilter {
                name: "test_filter".to_string(),
                expression: feed_expression("TEST_FEED"),
                priority: DEFAULT_PRIORITY,
                auto_priority: false,
                enabled: true,
                processor_kind: "noop".to_string(),
                min_meta_create_time: None,
                max_meta_create_time: None,
                max_processing_tasks: None,
            },
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.filter.name = name.to_string();
        self
    }

    pub fn with_expression(mut self, expression: ExpressionOperator) -> Self {
        self.filter.expression = expression;
        self
    }

    pub fn with_feed(mut self, feed: &str) -> Self {
        self.filter.expression = feed_expression(feed);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.filter.priority = priority;
        self
    }

    pub fn with_auto_priority(mut self) -> Self {
        self.filter.auto_priority = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.filter.enabled = false;
        self
    }

    pub fn with_processor_kind(mut self, kind: &str) -> Self {
        self.filter.processor_kind = kind.to_string();
        self
    }

    pub fn with_window(
        mut self,
        min: Option<DateTime<Utc>>,
        max: Option<DateTime<Utc>>,
    ) -> Self {
        self.filter.min_meta_create_time = min;
        self.filter.max_meta_create_time = max;
        self
    }

    pub fn with_max_processing_tasks(mut self, max: u32) -> Self {
        self.filter.max_processing_tasks = Some(max);
        self
    }

    pub fn build(self) -> NewFilter {
        self.filter
    }

    /// Build a stored filter with the given id, bypassing any repository
    pub fn build_stored(self, id: i64) -> Filter {
        let now = Utc::now();
        Filter {
            id,
            uuid: format!("filter-{id}"),
            name: self.filter.name,
            expression: self.filter.expression,
            priority: self.filter.priority,
            auto_priority: self.filter.auto_priority,
            enabled: self.filter.enabled,
            processor_kind: self.filter.processor_kind,
            min_meta_create_time: self.filter.min_meta_create_time,
            max_meta_create_time: self.filter.max_meta_create_time,
            max_processing_tasks: self.filter.max_processing_tasks,
            run_as: "tester".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for FilterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for metadata records
pub struct MetaRecordBuilder {
    record: NewMetaRecord,
}

impl MetaRecordBuilder {
    pub fn new() -> Self {
        Self {
            record: NewMetaRecord {
                feed_name: "TEST_FEED".to_string(),
                type_name: "Raw Events".to_string(),
                status: MetaStatus::Unlocked,
                create_time: Utc::now(),
                attributes: BTreeMap::new(),
            },
        }
    }

    pub fn with_feed(mut self, feed: &str) -> Self {
        self.record.feed_name = feed.to_string();
        self
    }

    pub fn with_type(mut self, type_name: &str) -> Self {
        self.record.type_name = type_name.to_string();
        self
    }

    pub fn with_status(mut self, status: MetaStatus) -> Self {
        self.record.status = status;
        self
    }

    pub fn with_create_time(mut self, create_time: DateTime<Utc>) -> Self {
        self.record.create_time = create_time;
        self
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.record.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> NewMetaRecord {
        self.record
    }
}

impl Default for MetaRecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task::new(1, 1, 1, Utc::now()),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.task.id = id;
        self
    }

    pub fn with_filter_id(mut self, filter_id: i64) -> Self {
        self.task.filter_id = filter_id;
        self
    }

    pub fn with_meta_id(mut self, meta_id: i64) -> Self {
        self.task.meta_id = meta_id;
        self
    }

    pub fn assigned_to(mut self, node_name: &str, at: DateTime<Utc>) -> Self {
        self.task.status = TaskStatus::Assigned;
        self.task.node_name = Some(node_name.to_string());
        self.task.assigned_at = Some(at);
        self.task.status_at = at;
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.task.version = version;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}
