//! 处理节点
//!
//! 按处理器类型注册执行器，从本进程或远程调度器领取任务，执行后汇报结果。

pub mod components;
pub mod executor_registry;
pub mod executors;
pub mod service;

pub use components::{DispatcherClient, LocalTaskSource, TaskExecutionManager, TaskSource};
pub use executor_registry::{ExecutorRegistry, ExecutorRegistryBuilder};
pub use executors::{ExecutionOutput, ExecutorAdapter, NoopExecutor, ShellExecutor};
pub use service::{WorkerService, WorkerServiceBuilder};
