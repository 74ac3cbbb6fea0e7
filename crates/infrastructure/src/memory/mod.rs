//! 内存存储实现
//!
//! 单进程部署和测试使用。每个存储内部只有一把锁，比较交换和去重创建都在锁内完成，
//! 因此与数据库实现具有相同的原子性语义。

pub mod memory_filter_repository;
pub mod memory_meta_store;
pub mod memory_task_store;

pub use memory_filter_repository::InMemoryFilterRepository;
pub use memory_meta_store::InMemoryMetaStore;
pub use memory_task_store::InMemoryTaskStore;

use scheduler_core::{SchedulerError, SchedulerResult};
use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> SchedulerResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| SchedulerError::Internal(format!("内存存储锁已损坏: {e}")))
}
