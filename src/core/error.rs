//! 错误类型
//!
//! 两层错误：
//! - `ErrorKind` / `TaskError`：子任务失败以数据形式随 TaskResult 传递，由调度器决定恢复或快速失败传播；
//! - `HiveError`：运行时自身的结构性错误（意图不可路由、配置、审计存储等），以 `Result` 返回给调用方。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Role, TaskId};
use crate::gateway::AuditError;

/// 子任务失败的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 网关输入校验未通过，不重试
    ValidationRejected,
    /// 确认被拒绝或超时，不重试
    ConfirmationDenied,
    /// 缓存资源创建失败（已退避重试一次）
    ResourceUnavailable,
    /// 沙箱执行或模型调用超时
    ExecutionTimeout,
    /// 命令非零退出 / 文件操作失败
    ExecutionFailed,
    /// 超出输出或文件大小上限
    ResourceLimit,
    /// 上游必需依赖失败
    DependencyFailure,
    CodeDefect,
    MissingDependency,
    SyntaxOrArgument,
    SystemOrPermission,
    Unclassified,
    /// 请求被取消
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationRejected => "validation_rejected",
            ErrorKind::ConfirmationDenied => "confirmation_denied",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::ResourceLimit => "resource_limit",
            ErrorKind::DependencyFailure => "dependency_failure",
            ErrorKind::CodeDefect => "code_defect",
            ErrorKind::MissingDependency => "missing_dependency",
            ErrorKind::SyntaxOrArgument => "syntax_or_argument",
            ErrorKind::SystemOrPermission => "system_or_permission",
            ErrorKind::Unclassified => "unclassified",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// 动作失败后是否交给恢复引擎（策略拒绝、依赖失败与取消不进入恢复）
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::ValidationRejected
                | ErrorKind::ConfirmationDenied
                | ErrorKind::DependencyFailure
                | ErrorKind::Cancelled
        )
    }

    /// 诊断结果类别（恢复引擎的分类输出）
    pub fn is_diagnosis(&self) -> bool {
        matches!(
            self,
            ErrorKind::CodeDefect
                | ErrorKind::MissingDependency
                | ErrorKind::SyntaxOrArgument
                | ErrorKind::SystemOrPermission
                | ErrorKind::Unclassified
        )
    }

    /// 从分类器标签解析诊断类别，仅接受诊断类别
    pub fn from_label(label: &str) -> Option<Self> {
        let kind: ErrorKind =
            serde_json::from_value(serde_json::Value::String(label.trim().to_lowercase())).ok()?;
        kind.is_diagnosis().then_some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 结构化的任务错误：类别 + 信息
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled")
    }
}

/// 运行时错误
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Unroutable intent: {0}")]
    UnroutableIntent(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("No worker registered for role {0}")]
    UnknownRole(Role),

    #[error("Unknown cache: {0}")]
    UnknownCache(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
