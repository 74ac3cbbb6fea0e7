use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Task, TaskStatus, TaskTransition},
    repositories::{CreateOutcome, TaskQuery, TaskStore},
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

use super::lock;

#[derive(Debug)]
struct TaskState {
    next_id: i64,
    tasks: BTreeMap<i64, Task>,
    by_pair: HashMap<(i64, i64), i64>,
}

#[derive(Debug)]
pub struct InMemoryTaskStore {
    state: Mutex<TaskState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TaskState {
                next_id: 1,
                tasks: BTreeMap::new(),
                by_pair: HashMap::new(),
            }),
        }
    }

    pub fn all_tasks(&self) -> SchedulerResult<Vec<Task>> {
        Ok(lock(&self.state)?.tasks.values().cloned().collect())
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(
        &self,
        filter_id: i64,
        meta_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<CreateOutcome> {
        let mut state = lock(&self.state)?;
        if state.by_pair.contains_key(&(filter_id, meta_id)) {
            return Ok(CreateOutcome::Duplicate);
        }

        let id = state.next_id;
        state.next_id += 1;
        let task = Task::new(id, filter_id, meta_id, now);
        state.by_pair.insert((filter_id, meta_id), id);
        state.tasks.insert(id, task.clone());
        debug!("创建任务成功: {}", task.entity_description());
        Ok(CreateOutcome::Created(task))
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>> {
        Ok(lock(&self.state)?.tasks.get(&id).cloned())
    }

    async fn find(&self, query: &TaskQuery) -> SchedulerResult<Vec<Task>> {
        let state = lock(&self.state)?;
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(state
            .tasks
            .values()
            .filter(|task| query.matches(task))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, filter_id: i64, status: TaskStatus) -> SchedulerResult<u64> {
        let state = lock(&self.state)?;
        Ok(state
            .tasks
            .values()
            .filter(|task| task.filter_id == filter_id && task.status == status)
            .count() as u64)
    }

    async fn compare_and_swap(
        &self,
        observed: &Task,
        transition: &TaskTransition,
    ) -> SchedulerResult<Option<Task>> {
        let next = transition
            .apply(observed)
            .ok_or_else(|| SchedulerError::TaskStateConflict {
                id: observed.id,
                message: format!(
                    "不能从 {} 迁移到 {}",
                    observed.status,
                    transition.to_status()
                ),
            })?;

        let mut state = lock(&self.state)?;
        let Some(current) = state.tasks.get_mut(&observed.id) else {
            return Err(SchedulerError::TaskNotFound { id: observed.id });
        };

        if current.version != observed.version || current.status != observed.status {
            return Ok(None);
        }

        *current = next.clone();
        Ok(Some(next))
    }
}
