//! 调用方上下文
//!
//! 所有调度操作都显式接收一个 [`CallerContext`]，由调用方声明以谁的身份执行，
//! 不依赖任何线程级或任务级的隐式状态。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{SchedulerError, SchedulerResult};

/// 调用身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Principal {
    /// 调度器内部的处理身份，拥有全部权限
    Processing,
    /// 处理节点，只能领取和汇报属于自己的任务
    Node(String),
    /// 运维人员
    User(String),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Processing => write!(f, "processing"),
            Principal::Node(name) => write!(f, "node:{name}"),
            Principal::User(name) => write!(f, "user:{name}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallerContext {
    principal: Principal,
}

impl CallerContext {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }

    pub fn processing() -> Self {
        Self::new(Principal::Processing)
    }

    pub fn node(name: impl Into<String>) -> Self {
        Self::new(Principal::Node(name.into()))
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self::new(Principal::User(name.into()))
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn principal_name(&self) -> &str {
        match &self.principal {
            Principal::Processing => "processing",
            Principal::Node(name) | Principal::User(name) => name,
        }
    }

    /// 任务创建等内部操作只允许处理身份
    pub fn require_processing(&self) -> SchedulerResult<()> {
        match self.principal {
            Principal::Processing => Ok(()),
            _ => Err(SchedulerError::PermissionDenied(format!(
                "{} 不能执行内部处理操作",
                self.principal
            ))),
        }
    }

    /// 节点只能以自己的名义领取、汇报或归还任务
    pub fn require_node(&self, node_name: &str) -> SchedulerResult<()> {
        match &self.principal {
            Principal::Processing => Ok(()),
            Principal::Node(name) if name == node_name => Ok(()),
            _ => Err(SchedulerError::PermissionDenied(format!(
                "{} 不能代表节点 {node_name} 操作",
                self.principal
            ))),
        }
    }

    /// 过滤器管理和运行参数调整
    pub fn require_operator(&self) -> SchedulerResult<()> {
        match self.principal {
            Principal::Processing | Principal::User(_) => Ok(()),
            Principal::Node(_) => Err(SchedulerError::PermissionDenied(format!(
                "{} 不能执行管理操作",
                self.principal
            ))),
        }
    }
}
