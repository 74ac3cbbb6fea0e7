pub mod config;
pub mod context;
pub mod errors;

pub use context::{CallerContext, Principal};
pub use errors::{SchedulerError, SchedulerResult};
