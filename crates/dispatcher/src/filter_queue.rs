//! 过滤器优先级队列
//!
//! 按优先级从高到低给出本轮要扫描的过滤器。同一优先级内轮转起点，
//! 上一次扫描没有产出任务的过滤器在退避时间内不参与扫描。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use scheduler_core::{config::TuningHandle, SchedulerResult};
use scheduler_domain::entities::Filter;

use crate::filter_registry::FilterRegistry;

/// 即使没有收到变更通知也定期重新加载
const FILTER_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// 过滤器最近一次扫描的情况，只保存在内存中
#[derive(Debug, Clone, Serialize)]
pub struct FilterScanState {
    pub last_scan_at: DateTime<Utc>,
    pub last_task_count: u64,
    pub total_tasks_created: u64,
    pub scans: u64,
}

struct QueueState {
    changes: watch::Receiver<u64>,
    loaded_at: Option<Instant>,
    filters: Vec<Filter>,
    scans: HashMap<i64, FilterScanState>,
    /// 任务创建和任务分配各自轮转同优先级的起点
    create_rotation: HashMap<i32, usize>,
    assign_rotation: HashMap<i32, usize>,
}

pub struct FilterPriorityQueue {
    registry: Arc<FilterRegistry>,
    tuning: TuningHandle,
    state: Mutex<QueueState>,
}

/// 没有扫描过、上次有产出、或者退避时间已过的过滤器可以参与扫描
pub fn is_eligible(scan: Option<&FilterScanState>, now: DateTime<Utc>, backoff: Duration) -> bool {
    match scan {
        None => true,
        Some(state) if state.last_task_count > 0 => true,
        Some(state) => match (now - state.last_scan_at).to_std() {
            Ok(elapsed) => elapsed >= backoff,
            Err(_) => false,
        },
    }
}

/// 按优先级分组，每组内从轮转游标处开始，组间保持优先级从高到低
fn rotate_within_priority<'a>(
    filters: &'a [Filter],
    rotation: &mut HashMap<i32, usize>,
    keep: impl Fn(&Filter) -> bool,
) -> Vec<Filter> {
    let mut ordered = Vec::with_capacity(filters.len());
    for group in filters.chunk_by(|a, b| a.priority == b.priority) {
        let kept: Vec<&'a Filter> = group.iter().filter(|f| keep(f)).collect();
        if kept.is_empty() {
            continue;
        }
        let cursor = rotation.entry(group[0].priority).or_insert(0);
        let offset = *cursor % kept.len();
        *cursor = cursor.wrapping_add(1);

        ordered.extend(kept[offset..].iter().map(|f| (*f).clone()));
        ordered.extend(kept[..offset].iter().map(|f| (*f).clone()));
    }
    ordered
}

impl FilterPriorityQueue {
    pub fn new(registry: Arc<FilterRegistry>, tuning: TuningHandle) -> Self {
        let state = QueueState {
            changes: registry.subscribe(),
            loaded_at: None,
            filters: Vec::new(),
            scans: HashMap::new(),
            create_rotation: HashMap::new(),
            assign_rotation: HashMap::new(),
        };
        Self {
            registry,
            tuning,
            state: Mutex::new(state),
        }
    }

    async fn refresh(&self, state: &mut QueueState) -> SchedulerResult<()> {
        // 注册表与队列同生命周期，发送端不会先于接收端关闭
        let changed = state.changes.has_changed().unwrap_or(true);
        let expired = state
            .loaded_at
            .map_or(true, |at| at.elapsed() >= FILTER_RELOAD_INTERVAL);
        if !changed && !expired {
            return Ok(());
        }
        let version = *state.changes.borrow_and_update();

        let mut filters = self.registry.enabled_filters().await?;
        // 稳定排序，同优先级保持 ID 顺序
        filters.sort_by(|a, b| b.priority.cmp(&a.priority));

        state
            .scans
            .retain(|id, _| filters.iter().any(|f| f.id == *id));
        debug!("重新加载过滤器 {} 个, 注册表版本 {}", filters.len(), version);

        state.filters = filters;
        state.loaded_at = Some(Instant::now());
        Ok(())
    }

    /// 本轮任务创建要访问的过滤器，按优先级从高到低
    pub async fn next_filters(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Filter>> {
        let backoff = self.tuning.snapshot().await.skip_non_producing();
        let mut guard = self.state.lock().await;
        self.refresh(&mut guard).await?;

        let state = &mut *guard;
        let scans = &state.scans;
        Ok(rotate_within_priority(
            &state.filters,
            &mut state.create_rotation,
            |f| is_eligible(scans.get(&f.id), now, backoff),
        ))
    }

    /// 分配任务时的过滤器顺序，不考虑退避，同优先级同样轮转起点
    pub async fn prioritised_filters(&self) -> SchedulerResult<Vec<Filter>> {
        let mut guard = self.state.lock().await;
        self.refresh(&mut guard).await?;
        let state = &mut *guard;
        Ok(rotate_within_priority(
            &state.filters,
            &mut state.assign_rotation,
            |_| true,
        ))
    }

    pub async fn record_scan(&self, filter_id: i64, tasks_created: u64, now: DateTime<Utc>) {
        let mut guard = self.state.lock().await;
        let entry = guard.scans.entry(filter_id).or_insert(FilterScanState {
            last_scan_at: now,
            last_task_count: 0,
            total_tasks_created: 0,
            scans: 0,
        });
        entry.last_scan_at = now;
        entry.last_task_count = tasks_created;
        entry.total_tasks_created += tasks_created;
        entry.scans += 1;
    }

    pub async fn scan_state(&self, filter_id: i64) -> Option<FilterScanState> {
        self.state.lock().await.scans.get(&filter_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::{config::SchedulerTuning, CallerContext};
    use scheduler_infrastructure::InMemoryFilterRepository;
    use scheduler_testing_utils::FilterBuilder;

    async fn setup(priorities: &[i32]) -> (Arc<FilterRegistry>, FilterPriorityQueue, Vec<i64>) {
        let registry = Arc::new(FilterRegistry::new(Arc::new(InMemoryFilterRepository::new())));
        let ctx = CallerContext::processing();
        let mut ids = Vec::new();
        for (i, priority) in priorities.iter().enumerate() {
            let filter = registry
                .create(
                    &ctx,
                    FilterBuilder::new()
                        .with_name(&format!("filter-{i}"))
                        .with_priority(*priority)
                        .build(),
                )
                .await
                .unwrap();
            ids.push(filter.id);
        }
        let queue = FilterPriorityQueue::new(registry.clone(), TuningHandle::new(SchedulerTuning::default()));
        (registry, queue, ids)
    }

    fn ids(filters: &[Filter]) -> Vec<i64> {
        filters.iter().map(|f| f.id).collect()
    }

    #[test]
    fn test_eligibility_backoff() {
        let now = Utc::now();
        let backoff = Duration::from_secs(10);
        let idle = FilterScanState {
            last_scan_at: now - chrono::Duration::seconds(5),
            last_task_count: 0,
            total_tasks_created: 0,
            scans: 1,
        };
        assert!(is_eligible(None, now, backoff));
        assert!(!is_eligible(Some(&idle), now, backoff));
        assert!(is_eligible(Some(&idle), now + chrono::Duration::seconds(6), backoff));

        let productive = FilterScanState {
            last_task_count: 3,
            ..idle
        };
        assert!(is_eligible(Some(&productive), now, backoff));
    }

    #[tokio::test]
    async fn test_higher_priority_first() {
        let (_, queue, ids_by_creation) = setup(&[5, 10, 1]).await;
        let filters = queue.next_filters(Utc::now()).await.unwrap();
        assert_eq!(
            ids(&filters),
            vec![ids_by_creation[1], ids_by_creation[0], ids_by_creation[2]]
        );
    }

    #[tokio::test]
    async fn test_equal_priority_rotates() {
        let (_, queue, created) = setup(&[10, 10]).await;
        let now = Utc::now();
        let first = ids(&queue.next_filters(now).await.unwrap());
        let second = ids(&queue.next_filters(now).await.unwrap());
        assert_eq!(first, vec![created[0], created[1]]);
        assert_eq!(second, vec![created[1], created[0]]);
    }

    #[tokio::test]
    async fn test_assignment_order_rotates_independently() {
        let (_, queue, created) = setup(&[10, 10, 3]).await;
        let now = Utc::now();

        let first = ids(&queue.prioritised_filters().await.unwrap());
        let second = ids(&queue.prioritised_filters().await.unwrap());
        assert_eq!(first, vec![created[0], created[1], created[2]]);
        assert_eq!(second, vec![created[1], created[0], created[2]]);

        // 分配轮转不影响任务创建的起点
        let creation = ids(&queue.next_filters(now).await.unwrap());
        assert_eq!(creation, vec![created[0], created[1], created[2]]);
    }

    #[tokio::test]
    async fn test_non_producing_filter_backs_off() {
        let (_, queue, created) = setup(&[10, 5]).await;
        let now = Utc::now();

        queue.record_scan(created[0], 0, now).await;
        queue.record_scan(created[1], 4, now).await;

        let filters = queue.next_filters(now + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(ids(&filters), vec![created[1]]);

        let later = queue.next_filters(now + chrono::Duration::seconds(11)).await.unwrap();
        assert_eq!(ids(&later), vec![created[0], created[1]]);

        let state = queue.scan_state(created[1]).await.unwrap();
        assert_eq!(state.total_tasks_created, 4);
    }

    #[tokio::test]
    async fn test_registry_changes_are_picked_up() {
        let (registry, queue, created) = setup(&[10, 5]).await;
        assert_eq!(queue.prioritised_filters().await.unwrap().len(), 2);

        registry
            .set_enabled(&CallerContext::processing(), created[0], false)
            .await
            .unwrap();
        let filters = queue.prioritised_filters().await.unwrap();
        assert_eq!(ids(&filters), vec![created[1]]);
    }
}
