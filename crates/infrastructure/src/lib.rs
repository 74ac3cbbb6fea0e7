pub mod database;
pub mod memory;
pub mod observability;

pub use database::*;
pub use memory::*;
pub use observability::*;
