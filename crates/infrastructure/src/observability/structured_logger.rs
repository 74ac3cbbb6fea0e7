//! Structured logging utilities
//!
//! Event-style log lines for the processor scheduler. Each function emits one
//! `tracing` event with an `event` field so that log pipelines can filter on it.

use tracing::{error, info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_tasks_created(
        filter_id: i64,
        filter_name: &str,
        created: u64,
        examined: u64,
        min_meta_id: i64,
    ) {
        info!(
            event = "tasks_created",
            filter.id = filter_id,
            filter.name = filter_name,
            tasks.created = created,
            records.examined = examined,
            tracker.min_meta_id = min_meta_id,
            "Tasks created for filter"
        );
    }

    pub fn log_evaluation_error(filter_id: i64, meta_id: i64, message: &str) {
        warn!(
            event = "evaluation_error",
            filter.id = filter_id,
            meta.id = meta_id,
            error = message,
            "Record skipped, predicate evaluation failed"
        );
    }

    pub fn log_filter_error(filter_id: i64, filter_name: &str, message: &str) {
        error!(
            event = "filter_error",
            filter.id = filter_id,
            filter.name = filter_name,
            error = message,
            "Filter skipped because of a configuration error"
        );
    }

    pub fn log_tasks_assigned(node_name: &str, requested: usize, assigned: usize) {
        info!(
            event = "tasks_assigned",
            node.name = node_name,
            tasks.requested = requested,
            tasks.assigned = assigned,
            "Tasks assigned to node"
        );
    }

    pub fn log_task_outcome(task_id: i64, node_name: &str, outcome: &str, records_read: u64) {
        info!(
            event = "task_outcome",
            task.id = task_id,
            node.name = node_name,
            task.outcome = outcome,
            records.read = records_read,
            "Task outcome reported"
        );
    }

    pub fn log_task_reclaimed(task_id: i64, previous_node: &str, assigned_seconds: i64) {
        warn!(
            event = "task_reclaimed",
            task.id = task_id,
            node.name = previous_node,
            assigned.seconds = assigned_seconds,
            "Task returned to the pool after assignment timeout"
        );
    }

    pub fn log_system_error(component: &str, operation: &str, error: &dyn std::error::Error) {
        error!(
            event = "system_error",
            component = component,
            operation = operation,
            error = %error,
            "System error occurred"
        );
    }
}
