//! Metrics collector for the processor scheduler
//!
//! Counters, gauges and histograms covering task creation, assignment,
//! reclaim and outcome reporting. Handles are created once and shared, so
//! recording is cheap on the hot paths.

use anyhow::Result;
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::debug;

/// Metrics collector for the processor scheduler
pub struct MetricsCollector {
    // Task creation metrics
    tasks_created_total: Counter,
    duplicate_tasks_total: Counter,
    evaluation_errors_total: Counter,
    filter_errors_total: Counter,
    creation_pass_duration: Histogram,
    last_pass_tasks_created: Gauge,

    // Assignment metrics
    tasks_assigned_total: Counter,
    assignment_conflicts_total: Counter,
    tasks_reclaimed_total: Counter,
    tasks_abandoned_total: Counter,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tasks_created_total: counter!("scheduler_tasks_created_total"),
            duplicate_tasks_total: counter!("scheduler_duplicate_tasks_total"),
            evaluation_errors_total: counter!("scheduler_evaluation_errors_total"),
            filter_errors_total: counter!("scheduler_filter_errors_total"),
            creation_pass_duration: histogram!("scheduler_creation_pass_duration_seconds"),
            last_pass_tasks_created: gauge!("scheduler_last_pass_tasks_created"),
            tasks_assigned_total: counter!("scheduler_tasks_assigned_total"),
            assignment_conflicts_total: counter!("scheduler_assignment_conflicts_total"),
            tasks_reclaimed_total: counter!("scheduler_tasks_reclaimed_total"),
            tasks_abandoned_total: counter!("scheduler_tasks_abandoned_total"),
        })
    }

    // Task creation metrics

    /// Record the result of one filter scan
    pub fn record_filter_scan(
        &self,
        filter_id: i64,
        created: u64,
        duplicates: u64,
        evaluation_errors: u64,
    ) {
        self.tasks_created_total.increment(created);
        self.duplicate_tasks_total.increment(duplicates);
        self.evaluation_errors_total.increment(evaluation_errors);

        debug!(
            filter_id = filter_id,
            created = created,
            duplicates = duplicates,
            evaluation_errors = evaluation_errors,
            "Filter scan recorded"
        );
    }

    pub fn record_filter_error(&self) {
        self.filter_errors_total.increment(1);
    }

    /// Record a finished creation pass
    pub fn record_creation_pass(&self, tasks_created: u64, duration_seconds: f64) {
        self.creation_pass_duration.record(duration_seconds);
        self.last_pass_tasks_created.set(tasks_created as f64);
    }

    /// Current UNASSIGNED backlog of one filter
    pub fn update_unassigned_depth(&self, filter_id: i64, depth: u64) {
        gauge!("scheduler_unassigned_tasks", "filter_id" => filter_id.to_string()).set(depth as f64);
    }

    // Assignment metrics

    pub fn record_tasks_assigned(&self, node_name: &str, count: u64) {
        self.tasks_assigned_total.increment(count);
        debug!(node = node_name, count = count, "Tasks assigned");
    }

    pub fn record_assignment_conflict(&self) {
        self.assignment_conflicts_total.increment(1);
    }

    pub fn record_tasks_reclaimed(&self, count: u64) {
        self.tasks_reclaimed_total.increment(count);
    }

    pub fn record_tasks_abandoned(&self, count: u64) {
        self.tasks_abandoned_total.increment(count);
    }

    pub fn record_task_outcome(&self, outcome: &str) {
        counter!("scheduler_task_outcomes_total", "outcome" => outcome.to_string()).increment(1);
    }
}
