//! # Scheduler Testing Utils
//!
//! Shared test data builders for the processor scheduler workspace.
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;

pub use builders::*;
pub use helpers::*;
