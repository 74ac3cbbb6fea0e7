//! Dispatcher Composition Root
//!
//! 过滤器注册表和优先级队列、按过滤器扫描元数据创建任务、向节点分配任务、
//! 结果汇报以及超时回收。

pub mod components;
pub mod controller;
pub mod filter_queue;
pub mod filter_registry;
pub mod outcome_service;
pub mod progress_monitor;
pub mod reclaim_service;
pub mod task_creator;
pub mod task_fetcher;

pub use components::DispatcherComponents;
pub use controller::{CreationPassReport, TaskCreationController};
pub use filter_queue::{FilterPriorityQueue, FilterScanState};
pub use filter_registry::FilterRegistry;
pub use outcome_service::TaskOutcomeService;
pub use progress_monitor::{FilterProgress, ProgressMonitor, ProgressSummary};
pub use reclaim_service::{ReclaimConfig, ReclaimReport, ReclaimService, TaskReclaimService};
pub use task_creator::TaskCreator;
pub use task_fetcher::TaskFetcher;
