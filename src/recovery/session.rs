//! 恢复会话的数据模型与策略选择

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ActionSuggestion, ErrorKind, TaskError, TaskId};

/// 恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// 合成修复任务（安装依赖 / 修改代码），成功后重试原动作
    RepairThenRetry,
    /// 修正参数后直接重试
    RetryWithCorrection,
    /// 调研后给出人工建议，不自动重试
    ResearchThenManual,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::RepairThenRetry => "repair_then_retry",
            RecoveryStrategy::RetryWithCorrection => "retry_with_correction",
            RecoveryStrategy::ResearchThenManual => "research_then_manual",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 策略只取决于诊断类别
pub fn select_strategy(kind: ErrorKind) -> RecoveryStrategy {
    match kind {
        ErrorKind::MissingDependency | ErrorKind::CodeDefect => RecoveryStrategy::RepairThenRetry,
        ErrorKind::SyntaxOrArgument => RecoveryStrategy::RetryWithCorrection,
        _ => RecoveryStrategy::ResearchThenManual,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Diagnosing,
    StrategySelected,
    Researching,
    Repairing,
    Retrying,
    Resolved,
    Exhausted,
}

impl RecoveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryState::Resolved | RecoveryState::Exhausted)
    }
}

/// 一次尝试中执行的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStep {
    Research,
    Repair,
    Retry,
}

/// 尝试记录；同一轮的修复与重试共享 number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub number: u32,
    pub step: AttemptStep,
    pub task_id: Option<TaskId>,
    pub action: Option<ActionSuggestion>,
    pub succeeded: bool,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryAttempt {
    pub fn new(
        number: u32,
        step: AttemptStep,
        task_id: Option<TaskId>,
        action: Option<ActionSuggestion>,
        succeeded: bool,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            number,
            step,
            task_id,
            action,
            succeeded,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 一次失败动作对应一个恢复会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySession {
    pub id: String,
    pub original_task: TaskId,
    pub original_action: ActionSuggestion,
    pub operation_class: String,
    pub original_error: TaskError,
    pub error_classification: ErrorKind,
    pub diagnosis_detail: Option<String>,
    pub strategy: Option<RecoveryStrategy>,
    pub attempts: Vec<RecoveryAttempt>,
    pub state: RecoveryState,
    /// 终态说明；exhausted 时为可直接给人看的建议
    pub summary: Option<String>,
    pub final_output: Option<String>,
}

impl RecoverySession {
    pub fn new(original_task: TaskId, original_action: ActionSuggestion, original_error: TaskError) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            original_task,
            operation_class: original_action.operation_class(),
            original_action,
            error_classification: ErrorKind::Unclassified,
            original_error,
            diagnosis_detail: None,
            strategy: None,
            attempts: Vec::new(),
            state: RecoveryState::Diagnosing,
            summary: None,
            final_output: None,
        }
    }

    pub fn transition(&mut self, state: RecoveryState) {
        tracing::debug!(session = %self.id, from = ?self.state, to = ?state, "recovery state");
        self.state = state;
    }

    pub fn is_resolved(&self) -> bool {
        self.state == RecoveryState::Resolved
    }

    pub fn last_attempt(&self) -> Option<&RecoveryAttempt> {
        self.attempts.last()
    }

    /// 已进行的轮数
    pub fn rounds(&self) -> u32 {
        self.attempts.iter().map(|a| a.number).max().unwrap_or(0)
    }
}
