//! Small helpers shared by tests across the workspace

use scheduler_domain::expression::{fields, Condition, ExpressionOperator, ExpressionTerm};

/// `Feed = <feed>`
pub fn feed_expression(feed: &str) -> ExpressionOperator {
    ExpressionOperator::and(vec![
        ExpressionTerm::new(fields::FEED, Condition::Equals, feed).into()
    ])
}

/// `Type = <type_name>`
pub fn type_expression(type_name: &str) -> ExpressionOperator {
    ExpressionOperator::and(vec![
        ExpressionTerm::new(fields::TYPE, Condition::Equals, type_name).into()
    ])
}
