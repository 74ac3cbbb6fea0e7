pub mod admin;
pub mod filters;
pub mod health;
pub mod metrics;
pub mod nodes;
pub mod tasks;
