//! 工作者（Agent）
//!
//! 每个角色一个工作者，统一实现 [`Worker::execute`]；注册表是启动时构建的 角色 → 实现 映射。
//! 工作者声明所需资源（模型 / 租户记忆），由调度层经 ResourceCache 解析后传入。
//! 结果中的动作建议解析为类型化的 [`ActionSuggestion`]，交由调度器合成执行任务。

pub mod code_edit;
pub mod generation;
pub mod research;
pub mod retrieval;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::TenantScope;
use crate::core::{ActionSuggestion, ErrorKind, Role, Task, TaskError, TaskResult};
use crate::llm::{generate_with_timeout, GenerateParams, LanguageModel, LlmError};
use crate::memory::MemoryStore;

pub use code_edit::CodeEditWorker;
pub use generation::GenerationWorker;
pub use research::WebResearchWorker;
pub use retrieval::RetrievalWorker;

/// 模型输出动作建议的格式说明，拼在生成类提示词中
pub const ACTION_FORMAT: &str = "If the request needs a side effect, append exactly one JSON object on its own line:\n\
{\"tool\": \"create_file\", \"args\": {\"path\": \"<relative path>\", \"content\": \"<text>\"}}\n\
Other tools: edit_file {path, content}, read_file {path}, list_dir {path}, run_terminal_command {argv: [program, args...]}.\n\
Paths are relative to the project root. Otherwise answer in plain text.";

/// 工作者声明的资源需求
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceNeeds {
    pub model: bool,
    pub memory: bool,
}

/// 调度层为一次执行解析好的资源
#[derive(Clone)]
pub struct ResolvedResources {
    pub model: Option<Arc<dyn LanguageModel>>,
    pub memory: Option<Arc<dyn MemoryStore>>,
    pub params: GenerateParams,
    pub scope: TenantScope,
    pub search_limit: usize,
}

impl ResolvedResources {
    pub fn new(scope: TenantScope, params: GenerateParams, search_limit: usize) -> Self {
        Self {
            model: None,
            memory: None,
            params,
            scope,
            search_limit,
        }
    }

    pub fn model(&self) -> Result<&Arc<dyn LanguageModel>, TaskError> {
        self.model
            .as_ref()
            .ok_or_else(|| TaskError::new(ErrorKind::ResourceUnavailable, "no model resolved"))
    }

    pub fn memory(&self) -> Result<&Arc<dyn MemoryStore>, TaskError> {
        self.memory
            .as_ref()
            .ok_or_else(|| TaskError::new(ErrorKind::ResourceUnavailable, "no memory store resolved"))
    }

    /// 带超时的模型调用，错误映射为任务错误
    pub async fn generate(&self, prompt: &str) -> Result<String, TaskError> {
        let model = self.model()?;
        generate_with_timeout(model.as_ref(), prompt, &self.params)
            .await
            .map_err(|e| match e {
                LlmError::Timeout(_) => TaskError::new(ErrorKind::ExecutionTimeout, e.to_string()),
                LlmError::Backend(_) => TaskError::new(ErrorKind::ExecutionFailed, e.to_string()),
            })
    }
}

/// 工作者 trait
#[async_trait]
pub trait Worker: Send + Sync {
    fn role(&self) -> Role;

    fn needs(&self) -> ResourceNeeds;

    async fn execute(&self, task: &Task, resources: &ResolvedResources) -> TaskResult;
}

/// 工作者注册表
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<Role, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: impl Worker + 'static) {
        self.register_arc(Arc::new(worker));
    }

    pub fn register_arc(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.role(), worker);
    }

    pub fn get(&self, role: Role) -> Option<Arc<dyn Worker>> {
        self.workers.get(&role).cloned()
    }

    pub fn contains(&self, role: Role) -> bool {
        self.workers.contains_key(&role)
    }

    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.workers.keys().copied().collect();
        roles.sort();
        roles
    }
}

/// 拼接上游输出，降级依赖给出说明
pub fn upstream_section(task: &Task) -> String {
    let mut section = String::new();
    for output in task.upstream_outputs().filter(|o| !o.trim().is_empty()) {
        section.push_str("Context:\n");
        section.push_str(output.trim());
        section.push('\n');
    }
    if task.is_degraded() {
        section.push_str("(Some upstream context was unavailable.)\n");
    }
    section
}

/// 从模型输出中解析动作建议：返回 (给人看的文本, 建议)
pub fn parse_suggestion(output: &str) -> (String, Option<ActionSuggestion>) {
    let trimmed = output.trim();
    let found = json_spans(trimmed).into_iter().find_map(|(start, end)| {
        let json = &trimmed[start..end];
        serde_json::from_str::<ActionSuggestion>(json.trim())
            .ok()
            .or_else(|| command_string(json))
            .map(|suggestion| (start, end, suggestion))
    });
    let Some((start, end, suggestion)) = found else {
        return (trimmed.to_string(), None);
    };
    let prose = format!("{}{}", &trimmed[..start], &trimmed[end..])
        .replace("```json", "")
        .replace("```", "");
    let prose = prose.trim();
    let text = if prose.is_empty() {
        suggestion.summary()
    } else {
        prose.to_string()
    };
    (text, Some(suggestion))
}

/// 候选 JSON 片段：```json 代码块优先，其次每个 `{` 起始处能完整解析的对象
fn json_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    if let Some(fence) = text.find("```json") {
        let body = fence + "```json".len();
        let end = text[body..]
            .find("```")
            .map(|e| body + e)
            .unwrap_or(text.len());
        spans.push((body, end));
    }
    for (start, _) in text.match_indices('{') {
        let mut stream =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<serde_json::Value>();
        if let Some(Ok(serde_json::Value::Object(_))) = stream.next() {
            spans.push((start, start + stream.byte_offset()));
        }
    }
    spans
}

/// 兼容 `{"tool": "run_terminal_command", "args": {"command": "pytest -q"}}`
fn command_string(json: &str) -> Option<ActionSuggestion> {
    let value: serde_json::Value = serde_json::from_str(json.trim()).ok()?;
    if value.get("tool")?.as_str()? != "run_terminal_command" {
        return None;
    }
    let command = value.get("args")?.get("command")?.as_str()?;
    let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    (!argv.is_empty()).then_some(ActionSuggestion::RunTerminalCommand { argv })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text() {
        let (text, suggestion) = parse_suggestion("  Rust is a systems language.  ");
        assert_eq!(text, "Rust is a systems language.");
        assert!(suggestion.is_none());
    }

    #[test]
    fn test_parse_fenced_suggestion() {
        let output = "Creating it now.\n```json\n{\"tool\": \"create_file\", \"args\": {\"path\": \"out.txt\", \"content\": \"hello\"}}\n```";
        let (text, suggestion) = parse_suggestion(output);
        assert_eq!(text, "Creating it now.");
        assert_eq!(
            suggestion,
            Some(ActionSuggestion::CreateFile {
                path: "out.txt".into(),
                content: "hello".into()
            })
        );
    }

    #[test]
    fn test_parse_bare_json_and_command_string() {
        let (text, suggestion) =
            parse_suggestion(r#"{"tool": "run_terminal_command", "args": {"command": "pytest -q"}}"#);
        assert_eq!(text, "run_terminal_command pytest -q");
        assert_eq!(suggestion.unwrap().program(), Some("pytest"));
    }

    #[test]
    fn test_braces_in_prose_before_json() {
        let output = r#"Use `{}` placeholders with format!. {"tool": "create_file", "args": {"path": "fmt.rs", "content": "x"}} Done {ok}."#;
        let (text, suggestion) = parse_suggestion(output);
        assert_eq!(
            suggestion,
            Some(ActionSuggestion::CreateFile {
                path: "fmt.rs".into(),
                content: "x".into()
            })
        );
        assert!(text.starts_with("Use `{}` placeholders"));
        assert!(text.ends_with("Done {ok}."));
    }

    #[test]
    fn test_unknown_json_is_text() {
        let (text, suggestion) = parse_suggestion(r#"{"answer": 42}"#);
        assert_eq!(text, r#"{"answer": 42}"#);
        assert!(suggestion.is_none());
    }

    #[test]
    fn test_upstream_section() {
        let task = Task::new(Role::Generation, "q")
            .with_context("upstream:task-1", "notes from memory")
            .with_context("degraded:task-2", "failed");
        let section = upstream_section(&task);
        assert!(section.contains("notes from memory"));
        assert!(section.contains("unavailable"));
    }
}
