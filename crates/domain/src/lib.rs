pub mod entities;
pub mod expression;
pub mod repositories;

pub use entities::*;
pub use expression::{Condition, ExpressionError, ExpressionItem, ExpressionOperator, ExpressionTerm, Op};
pub use repositories::*;
pub use scheduler_core::{SchedulerError, SchedulerResult};
