//! 任务数据模型
//!
//! Task 创建后不可变；调度器派发时基于上游结果生成带额外上下文的副本。
//! 动作建议（ActionSuggestion）是带标签的枚举，序列化格式与模型输出一致：
//! `{"tool": "create_file", "args": {"path": "out.txt", "content": "hello"}}`。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::{ErrorKind, TaskError};

/// 任务 ID（进程内单调递增）
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// 工作者角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// 从租户记忆中检索上下文
    ContextRetrieval,
    /// 调用模型生成回答（可附带动作建议）
    Generation,
    /// 网页调研
    WebResearch,
    /// 代码修改（产出 edit_file / create_file 建议）
    CodeEdit,
    /// 动作执行，交给 ActionGateway
    ToolExecution,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ContextRetrieval => "context_retrieval",
            Role::Generation => "generation",
            Role::WebResearch => "web_research",
            Role::CodeEdit => "code_edit",
            Role::ToolExecution => "tool_execution",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 依赖边类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// 上游失败则本任务以 DependencyFailure 失败
    Required,
    /// 上游失败时本任务仍执行，但上下文降级
    BestEffort,
}

/// 任务来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOrigin {
    /// 由路由表规划
    Planned,
    /// 由上游结果中的动作建议合成
    Suggested { from: TaskId },
    /// 恢复引擎注入的纠正 / 重试任务
    Recovery { for_task: TaskId },
}

/// 动作建议：工作者结果中携带的下一步副作用操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ActionSuggestion {
    CreateFile { path: String, content: String },
    EditFile { path: String, content: String },
    ReadFile { path: String },
    ListDir { path: String },
    RunTerminalCommand { argv: Vec<String> },
}

impl ActionSuggestion {
    pub fn tool_name(&self) -> &'static str {
        match self {
            ActionSuggestion::CreateFile { .. } => "create_file",
            ActionSuggestion::EditFile { .. } => "edit_file",
            ActionSuggestion::ReadFile { .. } => "read_file",
            ActionSuggestion::ListDir { .. } => "list_dir",
            ActionSuggestion::RunTerminalCommand { .. } => "run_terminal_command",
        }
    }

    /// 单行摘要，用于确认提示与审计
    pub fn summary(&self) -> String {
        match self {
            ActionSuggestion::CreateFile { path, content } => {
                format!("create_file {} ({} bytes)", path, content.len())
            }
            ActionSuggestion::EditFile { path, content } => {
                format!("edit_file {} ({} bytes)", path, content.len())
            }
            ActionSuggestion::ReadFile { path } => format!("read_file {}", path),
            ActionSuggestion::ListDir { path } => format!("list_dir {}", path),
            ActionSuggestion::RunTerminalCommand { argv } => {
                format!("run_terminal_command {}", argv.join(" "))
            }
        }
    }

    /// 命令动作的程序名
    pub fn program(&self) -> Option<&str> {
        match self {
            ActionSuggestion::RunTerminalCommand { argv } => argv.first().map(String::as_str),
            _ => None,
        }
    }

    /// 文件动作的目标路径
    pub fn target_path(&self) -> Option<&str> {
        match self {
            ActionSuggestion::CreateFile { path, .. }
            | ActionSuggestion::EditFile { path, .. }
            | ActionSuggestion::ReadFile { path }
            | ActionSuggestion::ListDir { path } => Some(path),
            ActionSuggestion::RunTerminalCommand { .. } => None,
        }
    }

    /// 熔断器使用的操作类别：命令按程序名区分，文件操作按工具名
    pub fn operation_class(&self) -> String {
        match self.program() {
            Some(program) => format!("{}:{}", self.tool_name(), program),
            None => self.tool_name().to_string(),
        }
    }
}

/// 子任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub role: Role,
    pub prompt: String,
    pub context: BTreeMap<String, String>,
    pub dependencies: BTreeMap<TaskId, EdgeKind>,
    /// 仅 ToolExecution 任务携带
    pub action: Option<ActionSuggestion>,
    pub origin: TaskOrigin,
}

impl Task {
    pub fn new(role: Role, prompt: impl Into<String>) -> Self {
        Self {
            id: TaskId::next(),
            role,
            prompt: prompt.into(),
            context: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            action: None,
            origin: TaskOrigin::Planned,
        }
    }

    /// 由动作建议构造执行任务
    pub fn action(action: ActionSuggestion, origin: TaskOrigin) -> Self {
        let mut task = Self::new(Role::ToolExecution, action.summary());
        task.action = Some(action);
        task.origin = origin;
        task
    }

    pub fn depends_on(mut self, id: TaskId, edge: EdgeKind) -> Self {
        self.dependencies.insert(id, edge);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// 上游任务输出（`upstream:<id>` 上下文项）
    pub fn upstream_outputs(&self) -> impl Iterator<Item = &str> {
        self.context
            .iter()
            .filter(|(k, _)| k.starts_with("upstream:"))
            .map(|(_, v)| v.as_str())
    }

    /// 是否有降级依赖（`degraded:<id>` 上下文项）
    pub fn is_degraded(&self) -> bool {
        self.context.keys().any(|k| k.starts_with("degraded:"))
    }
}

/// 网关收到的动作请求；风险等级由网关自行推导，不随请求传入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_id: String,
    pub action: ActionSuggestion,
    pub requesting_task: Option<TaskId>,
    pub actor: String,
}

impl ActionRequest {
    pub fn new(action: ActionSuggestion, requesting_task: Option<TaskId>, actor: impl Into<String>) -> Self {
        Self {
            action_id: uuid::Uuid::new_v4().to_string(),
            action,
            requesting_task,
            actor: actor.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
}

/// 子任务结果；error 当且仅当失败时存在
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub output: String,
    pub error: Option<TaskError>,
    pub suggestion: Option<ActionSuggestion>,
}

impl TaskResult {
    pub fn success(task_id: TaskId, output: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Success,
            output: output.into(),
            error: None,
            suggestion: None,
        }
    }

    pub fn failure(task_id: TaskId, error: TaskError) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failure,
            output: String::new(),
            error: Some(error),
            suggestion: None,
        }
    }

    pub fn fail(task_id: TaskId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::failure(task_id, TaskError::new(kind, message))
    }

    pub fn with_suggestion(mut self, suggestion: Option<ActionSuggestion>) -> Self {
        if self.status == TaskStatus::Success {
            self.suggestion = suggestion;
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// 调度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_wire_format() {
        let json = r#"{"tool": "create_file", "args": {"path": "out.txt", "content": "hello"}}"#;
        let parsed: ActionSuggestion = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            ActionSuggestion::CreateFile {
                path: "out.txt".into(),
                content: "hello".into()
            }
        );
        assert_eq!(parsed.tool_name(), "create_file");
    }

    #[test]
    fn test_operation_class() {
        let cmd = ActionSuggestion::RunTerminalCommand {
            argv: vec!["pytest".into(), "-q".into()],
        };
        assert_eq!(cmd.operation_class(), "run_terminal_command:pytest");
        let edit = ActionSuggestion::EditFile {
            path: "a.py".into(),
            content: String::new(),
        };
        assert_eq!(edit.operation_class(), "edit_file");
    }

    #[test]
    fn test_failure_never_carries_suggestion() {
        let id = TaskId::next();
        let result = TaskResult::fail(id, ErrorKind::ExecutionFailed, "boom").with_suggestion(Some(
            ActionSuggestion::ReadFile { path: "x".into() },
        ));
        assert!(result.suggestion.is_none());
        assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionFailed));
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = Task::new(Role::Generation, "a");
        let b = Task::new(Role::Generation, "b");
        assert_ne!(a.id, b.id);
    }
}
