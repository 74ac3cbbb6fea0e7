use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Filter, FilterTracker, NewFilter},
    repositories::FilterRepository,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

use super::lock;

#[derive(Debug, Default)]
struct FilterState {
    next_id: i64,
    filters: BTreeMap<i64, Filter>,
    trackers: HashMap<i64, FilterTracker>,
}

#[derive(Debug, Default)]
pub struct InMemoryFilterRepository {
    state: Mutex<FilterState>,
}

impl InMemoryFilterRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FilterRepository for InMemoryFilterRepository {
    async fn create(&self, filter: &NewFilter, priority: i32, run_as: &str) -> SchedulerResult<Filter> {
        let mut state = lock(&self.state)?;
        state.next_id += 1;
        let now = Utc::now();
        let created = Filter {
            id: state.next_id,
            uuid: Uuid::new_v4().to_string(),
            name: filter.name.clone(),
            expression: filter.expression.clone(),
            priority,
            auto_priority: filter.auto_priority,
            enabled: filter.enabled,
            processor_kind: filter.processor_kind.clone(),
            min_meta_create_time: filter.min_meta_create_time,
            max_meta_create_time: filter.max_meta_create_time,
            max_processing_tasks: filter.max_processing_tasks,
            run_as: run_as.to_string(),
            created_at: now,
            updated_at: now,
        };
        state.filters.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Filter>> {
        Ok(lock(&self.state)?.filters.get(&id).cloned())
    }

    async fn list(&self) -> SchedulerResult<Vec<Filter>> {
        Ok(lock(&self.state)?.filters.values().cloned().collect())
    }

    async fn update(&self, filter: &Filter) -> SchedulerResult<Filter> {
        let mut state = lock(&self.state)?;
        let existing = state
            .filters
            .get_mut(&filter.id)
            .ok_or(SchedulerError::FilterNotFound { id: filter.id })?;
        let mut updated = filter.clone();
        updated.updated_at = Utc::now();
        *existing = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: i64) -> SchedulerResult<bool> {
        let mut state = lock(&self.state)?;
        state.trackers.remove(&id);
        Ok(state.filters.remove(&id).is_some())
    }

    async fn get_tracker(&self, filter_id: i64) -> SchedulerResult<FilterTracker> {
        let state = lock(&self.state)?;
        Ok(state
            .trackers
            .get(&filter_id)
            .cloned()
            .unwrap_or_else(|| FilterTracker::new(filter_id)))
    }

    async fn save_tracker(&self, tracker: &FilterTracker) -> SchedulerResult<()> {
        let mut state = lock(&self.state)?;
        if !state.filters.contains_key(&tracker.filter_id) {
            return Err(SchedulerError::FilterNotFound {
                id: tracker.filter_id,
            });
        }
        state.trackers.insert(tracker.filter_id, tracker.clone());
        Ok(())
    }
}
