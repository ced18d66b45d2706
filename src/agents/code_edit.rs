//! 代码修改：让编码模型产出一个 edit_file / create_file 建议
//!
//! 恢复引擎合成的修复任务在上下文中带 `error`、`failed_action`、`path`，
//! 提示词据此要求模型给出修复后的完整文件内容。非文件类建议一律丢弃。

use async_trait::async_trait;

use crate::agents::{parse_suggestion, upstream_section, ResolvedResources, ResourceNeeds, Worker};
use crate::core::{ActionSuggestion, ErrorKind, Role, Task, TaskResult};

#[derive(Debug, Default, Clone)]
pub struct CodeEditWorker;

impl CodeEditWorker {
    fn prompt(task: &Task) -> String {
        let mut prompt = String::from(
            "You are a careful code editor. Reply with a one-line explanation followed by exactly one JSON object:\n\
             {\"tool\": \"edit_file\", \"args\": {\"path\": \"<relative path>\", \"content\": \"<full new file content>\"}}\n\
             Use create_file instead of edit_file for new files.\n",
        );
        if let Some(path) = task.context.get("path") {
            prompt.push_str(&format!("File: {}\n", path));
        }
        if let Some(action) = task.context.get("failed_action") {
            prompt.push_str(&format!("Failed action: {}\n", action));
        }
        if let Some(error) = task.context.get("error") {
            prompt.push_str(&format!("Error output:\n{}\n", error.trim()));
        }
        prompt.push_str(&upstream_section(task));
        prompt.push_str("Request:\n");
        prompt.push_str(&task.prompt);
        prompt
    }
}

#[async_trait]
impl Worker for CodeEditWorker {
    fn role(&self) -> Role {
        Role::CodeEdit
    }

    fn needs(&self) -> ResourceNeeds {
        ResourceNeeds {
            model: true,
            memory: false,
        }
    }

    async fn execute(&self, task: &Task, resources: &ResolvedResources) -> TaskResult {
        let raw = match resources.generate(&Self::prompt(task)).await {
            Ok(raw) => raw,
            Err(e) => return TaskResult::failure(task.id, e),
        };
        match parse_suggestion(&raw) {
            (text, Some(edit @ (ActionSuggestion::EditFile { .. } | ActionSuggestion::CreateFile { .. }))) => {
                TaskResult::success(task.id, text).with_suggestion(Some(edit))
            }
            (_, Some(other)) => TaskResult::fail(
                task.id,
                ErrorKind::ExecutionFailed,
                format!("code edit produced a non-file action: {}", other.tool_name()),
            ),
            // 修复任务必须产出编辑；普通编码请求允许纯文本回答
            (text, None) if task.context.contains_key("error") => TaskResult::fail(
                task.id,
                ErrorKind::ExecutionFailed,
                format!("code edit produced no edit: {}", text.lines().next().unwrap_or_default()),
            ),
            (text, None) => TaskResult::success(task.id, text),
        }
    }
}
