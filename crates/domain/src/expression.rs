//! 选择表达式
//!
//! 过滤器通过一棵由逻辑运算符和条件项组成的表达式树描述需要处理的元数据记录。
//! 调度器只关心三件事：表达式是否合法、包含多少条件项、某条记录是否命中。
//!
//! # 语义
//!
//! - `AND` / `OR` 按常规逻辑组合子节点，`NOT` 对子节点的合取取反
//! - 没有任何条件项的运算符不构成约束，求值时被忽略
//! - 已知字段: `Id`、`Feed`、`Type`、`Status`、`Create Time`（RFC 3339），
//!   其余字段名从记录的属性表中查找，属性不存在时视为不命中
//!
//! # 使用示例
//!
//! ```rust
//! use scheduler_domain::expression::{Condition, ExpressionOperator, ExpressionTerm, fields};
//!
//! let expr = ExpressionOperator::and(vec![
//!     ExpressionTerm::new(fields::FEED, Condition::Equals, "TEST_FEED").into(),
//!     ExpressionTerm::new(fields::ID, Condition::GreaterThan, "100").into(),
//! ]);
//! assert_eq!(expr.term_count(), 2);
//! assert!(expr.validate().is_ok());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entities::MetaRecord;
use scheduler_core::SchedulerError;

pub mod fields {
    pub const ID: &str = "Id";
    pub const FEED: &str = "Feed";
    pub const TYPE: &str = "Type";
    pub const STATUS: &str = "Status";
    pub const CREATE_TIME: &str = "Create Time";
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("字段 '{field}' 的条件无效: {message}")]
    InvalidTerm { field: String, message: String },

    #[error("表达式没有任何条件，拒绝处理不受约束的过滤器")]
    Unconstrained,

    #[error("记录 {meta_id} 的字段 '{field}' 求值失败: {message}")]
    Evaluation {
        meta_id: i64,
        field: String,
        message: String,
    },
}

impl From<ExpressionError> for SchedulerError {
    fn from(err: ExpressionError) -> Self {
        SchedulerError::InvalidExpression(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
    In,
    Between,
    Contains,
}

impl Condition {
    fn is_ordering(self) -> bool {
        matches!(
            self,
            Condition::GreaterThan
                | Condition::GreaterThanOrEqualTo
                | Condition::LessThan
                | Condition::LessThanOrEqualTo
                | Condition::Between
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpressionItem {
    Operator(ExpressionOperator),
    Term(ExpressionTerm),
}

impl From<ExpressionOperator> for ExpressionItem {
    fn from(op: ExpressionOperator) -> Self {
        ExpressionItem::Operator(op)
    }
}

impl From<ExpressionTerm> for ExpressionItem {
    fn from(term: ExpressionTerm) -> Self {
        ExpressionItem::Term(term)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionOperator {
    pub op: Op,
    #[serde(default)]
    pub children: Vec<ExpressionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionTerm {
    pub field: String,
    pub condition: Condition,
    pub value: String,
}

impl ExpressionTerm {
    pub fn new(field: &str, condition: Condition, value: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            condition,
            value: value.into(),
        }
    }

    fn invalid(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::InvalidTerm {
            field: self.field.clone(),
            message: message.into(),
        }
    }

    fn values(&self) -> Vec<&str> {
        self.value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect()
    }

    fn validate(&self) -> Result<(), ExpressionError> {
        if self.field.trim().is_empty() {
            return Err(self.invalid("字段名不能为空"));
        }

        let values = self.values();
        match self.condition {
            Condition::In if values.is_empty() => {
                return Err(self.invalid("IN 至少需要一个值"));
            }
            Condition::Between if values.len() != 2 => {
                return Err(self.invalid("BETWEEN 需要两个以逗号分隔的边界"));
            }
            Condition::In | Condition::Between => {}
            _ if self.value.trim().is_empty() => {
                return Err(self.invalid("条件值不能为空"));
            }
            _ => {}
        }

        let operands: Vec<&str> = match self.condition {
            Condition::In | Condition::Between => values,
            _ => vec![self.value.trim()],
        };

        match self.field.as_str() {
            fields::ID => {
                if self.condition == Condition::Contains {
                    return Err(self.invalid("Id 不支持 CONTAINS"));
                }
                for v in operands {
                    v.parse::<i64>()
                        .map_err(|_| self.invalid(format!("'{v}' 不是有效的 Id")))?;
                }
            }
            fields::CREATE_TIME => {
                if self.condition == Condition::Contains {
                    return Err(self.invalid("Create Time 不支持 CONTAINS"));
                }
                for v in operands {
                    parse_time(v).map_err(|m| self.invalid(m))?;
                }
            }
            fields::FEED | fields::TYPE | fields::STATUS => {
                if self.condition.is_ordering() {
                    return Err(self.invalid("文本字段不支持大小比较"));
                }
            }
            _ => {
                if self.condition.is_ordering() {
                    for v in operands {
                        v.parse::<f64>()
                            .map_err(|_| self.invalid(format!("'{v}' 不是数值")))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn matches(&self, record: &MetaRecord) -> Result<bool, ExpressionError> {
        match self.field.as_str() {
            fields::ID => {
                let parsed = self
                    .parse_operands(|v| v.parse::<i64>().map_err(|e| e.to_string()))
                    .map_err(|m| self.evaluation(record, m))?;
                Ok(compare(self.condition, &record.id, &parsed))
            }
            fields::CREATE_TIME => {
                let parsed = self
                    .parse_operands(parse_time)
                    .map_err(|m| self.evaluation(record, m))?;
                Ok(compare(self.condition, &record.create_time, &parsed))
            }
            fields::FEED => Ok(self.match_text(&record.feed_name)),
            fields::TYPE => Ok(self.match_text(&record.type_name)),
            fields::STATUS => Ok(self.match_text(record.status.as_str())),
            name => match record.attributes.get(name) {
                None => Ok(false),
                Some(actual) if self.condition.is_ordering() => {
                    let actual = actual.trim().parse::<f64>().map_err(|_| {
                        self.evaluation(record, format!("属性值 '{actual}' 不是数值"))
                    })?;
                    let parsed = self
                        .parse_operands(|v| v.parse::<f64>().map_err(|e| e.to_string()))
                        .map_err(|m| self.evaluation(record, m))?;
                    Ok(compare(self.condition, &actual, &parsed))
                }
                Some(actual) => Ok(self.match_text(actual)),
            },
        }
    }

    fn parse_operands<T, F>(&self, parse: F) -> Result<Vec<T>, String>
    where
        F: Fn(&str) -> Result<T, String>,
    {
        match self.condition {
            Condition::In | Condition::Between => self.values().into_iter().map(parse).collect(),
            _ => parse(self.value.trim()).map(|v| vec![v]),
        }
    }

    fn match_text(&self, actual: &str) -> bool {
        let expected = self.value.trim();
        match self.condition {
            Condition::Equals => actual == expected,
            Condition::NotEquals => actual != expected,
            Condition::In => self.values().contains(&actual),
            Condition::Contains => actual.contains(expected),
            _ => false,
        }
    }

    fn evaluation(&self, record: &MetaRecord, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Evaluation {
            meta_id: record.id,
            field: self.field.clone(),
            message: message.into(),
        }
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("'{value}' 不是 RFC 3339 时间: {e}"))
}

fn compare<T: PartialOrd>(condition: Condition, actual: &T, operands: &[T]) -> bool {
    let Some(first) = operands.first() else {
        return false;
    };
    match condition {
        Condition::Equals => actual == first,
        Condition::NotEquals => actual != first,
        Condition::GreaterThan => actual > first,
        Condition::GreaterThanOrEqualTo => actual >= first,
        Condition::LessThan => actual < first,
        Condition::LessThanOrEqualTo => actual <= first,
        Condition::In => operands.iter().any(|v| v == actual),
        Condition::Between => operands.get(1).is_some_and(|last| actual >= first && actual <= last),
        Condition::Contains => false,
    }
}

impl ExpressionOperator {
    pub fn new(op: Op, children: Vec<ExpressionItem>) -> Self {
        Self { op, children }
    }

    pub fn and(children: Vec<ExpressionItem>) -> Self {
        Self::new(Op::And, children)
    }

    pub fn or(children: Vec<ExpressionItem>) -> Self {
        Self::new(Op::Or, children)
    }

    pub fn not(children: Vec<ExpressionItem>) -> Self {
        Self::new(Op::Not, children)
    }

    /// 表达式中条件项的总数
    pub fn term_count(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                ExpressionItem::Operator(op) => op.term_count(),
                ExpressionItem::Term(_) => 1,
            })
            .sum()
    }

    pub fn validate(&self) -> Result<(), ExpressionError> {
        for child in &self.children {
            match child {
                ExpressionItem::Operator(op) => op.validate()?,
                ExpressionItem::Term(term) => term.validate()?,
            }
        }
        Ok(())
    }

    /// 移除指定字段上的所有条件项
    pub fn without_field(&self, field: &str) -> ExpressionOperator {
        let children = self
            .children
            .iter()
            .filter_map(|child| match child {
                ExpressionItem::Operator(op) => Some(op.without_field(field).into()),
                ExpressionItem::Term(term) if term.field == field => None,
                ExpressionItem::Term(term) => Some(term.clone().into()),
            })
            .collect();
        Self::new(self.op, children)
    }

    /// 扫描前的准备: 去掉状态条件(状态由调度器自己限定)，校验，并拒绝没有约束的表达式
    pub fn prepare_for_scan(&self) -> Result<ExpressionOperator, ExpressionError> {
        let sanitised = self.without_field(fields::STATUS);
        sanitised.validate()?;
        if sanitised.term_count() == 0 {
            return Err(ExpressionError::Unconstrained);
        }
        Ok(sanitised)
    }

    pub fn matches(&self, record: &MetaRecord) -> Result<bool, ExpressionError> {
        let mut results = Vec::with_capacity(self.children.len());
        for child in &self.children {
            match child {
                ExpressionItem::Operator(op) if op.term_count() == 0 => continue,
                ExpressionItem::Operator(op) => results.push(op.matches(record)?),
                ExpressionItem::Term(term) => results.push(term.matches(record)?),
            }
        }

        if results.is_empty() {
            return Ok(true);
        }

        Ok(match self.op {
            Op::And => results.iter().all(|r| *r),
            Op::Or => results.iter().any(|r| *r),
            Op::Not => !results.iter().all(|r| *r),
        })
    }
}
