pub mod dispatcher_client;
pub mod task_execution;
pub mod task_source;

pub use dispatcher_client::DispatcherClient;
pub use task_execution::TaskExecutionManager;
pub use task_source::{LocalTaskSource, TaskSource};
