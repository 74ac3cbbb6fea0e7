//! 单轮任务创建的进度统计

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use scheduler_domain::entities::Filter;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterProgress {
    pub filter_id: i64,
    pub filter_name: String,
    pub records_examined: u64,
    pub tasks_created: u64,
    pub duplicates: u64,
    pub evaluation_errors: u64,
    pub elapsed_ms: u64,
    pub completed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSummary {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub filters_visited: usize,
    pub records_examined: u64,
    pub tasks_created: u64,
    pub duplicates: u64,
    pub evaluation_errors: u64,
    pub filter_errors: usize,
    pub filters: Vec<FilterProgress>,
}

/// 多个创建工作者共享同一个监视器
pub struct ProgressMonitor {
    started_at: DateTime<Utc>,
    started: Instant,
    filters: Mutex<BTreeMap<i64, FilterProgress>>,
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            filters: Mutex::new(BTreeMap::new()),
        }
    }

    fn update<F: FnOnce(&mut FilterProgress)>(&self, filter_id: i64, f: F) {
        let mut filters = self.filters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = filters.entry(filter_id).or_insert_with(|| FilterProgress {
            filter_id,
            ..Default::default()
        });
        f(entry);
    }

    pub fn start_filter(&self, filter: &Filter) {
        self.update(filter.id, |p| p.filter_name = filter.name.clone());
    }

    pub fn accumulate(&self, filter_id: i64, records_examined: u64, tasks_created: u64) {
        self.update(filter_id, |p| {
            p.records_examined += records_examined;
            p.tasks_created += tasks_created;
        });
    }

    pub fn record_duplicates(&self, filter_id: i64, duplicates: u64) {
        self.update(filter_id, |p| p.duplicates += duplicates);
    }

    pub fn record_evaluation_errors(&self, filter_id: i64, errors: u64) {
        self.update(filter_id, |p| p.evaluation_errors += errors);
    }

    pub fn record_error(&self, filter_id: i64, message: String) {
        self.update(filter_id, |p| p.error = Some(message));
    }

    pub fn complete_filter(&self, filter_id: i64, elapsed: Duration) {
        self.update(filter_id, |p| {
            p.completed = true;
            p.elapsed_ms = elapsed.as_millis() as u64;
        });
    }

    pub fn summary(&self) -> ProgressSummary {
        let filters: Vec<FilterProgress> = self
            .filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        ProgressSummary {
            started_at: self.started_at,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            filters_visited: filters.len(),
            records_examined: filters.iter().map(|p| p.records_examined).sum(),
            tasks_created: filters.iter().map(|p| p.tasks_created).sum(),
            duplicates: filters.iter().map(|p| p.duplicates).sum(),
            evaluation_errors: filters.iter().map(|p| p.evaluation_errors).sum(),
            filter_errors: filters.iter().filter(|p| p.error.is_some()).count(),
            filters,
        }
    }

    /// 输出本轮汇总，每个过滤器的明细在 debug 级别
    pub fn report(&self) {
        let summary = self.summary();
        info!(
            filters_visited = summary.filters_visited,
            records_examined = summary.records_examined,
            tasks_created = summary.tasks_created,
            duplicates = summary.duplicates,
            filter_errors = summary.filter_errors,
            elapsed_ms = summary.elapsed_ms,
            "任务创建完成: 访问过滤器 {} 个, 创建任务 {} 个",
            summary.filters_visited,
            summary.tasks_created
        );
        for progress in &summary.filters {
            debug!(
                filter_id = progress.filter_id,
                records_examined = progress.records_examined,
                tasks_created = progress.tasks_created,
                elapsed_ms = progress.elapsed_ms,
                "过滤器 '{}'{}",
                progress.filter_name,
                progress
                    .error
                    .as_deref()
                    .map(|e| format!(" 出错: {e}"))
                    .unwrap_or_default()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_testing_utils::FilterBuilder;

    #[test]
    fn test_summary_aggregates_filters() {
        let monitor = ProgressMonitor::new();
        let a = FilterBuilder::new().with_name("a").build_stored(1);
        let b = FilterBuilder::new().with_name("b").build_stored(2);

        monitor.start_filter(&a);
        monitor.accumulate(1, 100, 10);
        monitor.accumulate(1, 5, 1);
        monitor.record_duplicates(1, 2);
        monitor.complete_filter(1, Duration::from_millis(20));

        monitor.start_filter(&b);
        monitor.record_error(2, "表达式没有任何条件".to_string());
        monitor.complete_filter(2, Duration::from_millis(1));

        let summary = monitor.summary();
        assert_eq!(summary.filters_visited, 2);
        assert_eq!(summary.records_examined, 105);
        assert_eq!(summary.tasks_created, 11);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(summary.filter_errors, 1);
        assert_eq!(summary.filters[0].filter_name, "a");
        assert!(summary.filters.iter().all(|p| p.completed));
    }
}
