//! 生成：调用角色对应的模型回答请求，输出中可附带一个动作建议；问答写回租户记忆

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::agents::{parse_suggestion, upstream_section, ResolvedResources, ResourceNeeds, Worker, ACTION_FORMAT};
use crate::core::{Role, Task, TaskResult};

#[derive(Debug, Default, Clone)]
pub struct GenerationWorker;

impl GenerationWorker {
    fn prompt(task: &Task) -> String {
        format!(
            "You are a helpful local assistant.\n{}\n{}Request:\n{}",
            ACTION_FORMAT,
            upstream_section(task),
            task.prompt
        )
    }
}

#[async_trait]
impl Worker for GenerationWorker {
    fn role(&self) -> Role {
        Role::Generation
    }

    fn needs(&self) -> ResourceNeeds {
        ResourceNeeds {
            model: true,
            memory: true,
        }
    }

    async fn execute(&self, task: &Task, resources: &ResolvedResources) -> TaskResult {
        let raw = match resources.generate(&Self::prompt(task)).await {
            Ok(raw) => raw,
            Err(e) => return TaskResult::failure(task.id, e),
        };
        let (text, suggestion) = parse_suggestion(&raw);

        if let Some(memory) = &resources.memory {
            let metadata = BTreeMap::from([
                ("role".to_string(), Role::Generation.to_string()),
                ("task_id".to_string(), task.id.to_string()),
            ]);
            let record = format!("Q: {}\nA: {}", task.prompt, text);
            if let Err(e) = memory.add(&record, metadata).await {
                tracing::warn!(task_id = %task.id, scope = %resources.scope, error = %e, "memory write failed");
            }
        }

        TaskResult::success(task.id, text).with_suggestion(suggestion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TenantScope;
    use crate::core::{ActionSuggestion, ErrorKind};
    use crate::llm::{GenerateParams, LanguageModel, LlmError, ScriptedLanguageModel};
    use crate::memory::{InMemoryStore, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn resources(model: Arc<dyn LanguageModel>, memory: Arc<InMemoryStore>) -> ResolvedResources {
        let mut r = ResolvedResources::new(TenantScope::new("acme", None), GenerateParams::default(), 5);
        r.model = Some(model);
        r.memory = Some(memory);
        r
    }

    #[tokio::test]
    async fn test_generation_carries_suggestion_and_writes_memory() {
        let model = Arc::new(ScriptedLanguageModel::new("m").respond_when(
            "out.txt",
            r#"{"tool": "create_file", "args": {"path": "out.txt", "content": "hello"}}"#,
        ));
        let memory = Arc::new(InMemoryStore::new(10));
        let task = Task::new(Role::Generation, "create a file named out.txt with content hello")
            .with_context("upstream:task-0", "project uses python");
        let result = GenerationWorker.execute(&task, &resources(model, memory.clone())).await;

        assert!(result.is_success());
        assert_eq!(
            result.suggestion,
            Some(ActionSuggestion::CreateFile {
                path: "out.txt".into(),
                content: "hello".into()
            })
        );
        assert_eq!(memory.len(), 1);
        let hits = memory.search("out.txt", 1).await.unwrap();
        assert!(hits[0].content.starts_with("Q: create a file"));
    }

    struct HangingModel;

    #[async_trait]
    impl LanguageModel for HangingModel {
        fn model_id(&self) -> &str {
            "hanging"
        }

        async fn generate(&self, _prompt: &str, _params: &GenerateParams) -> Result<String, LlmError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_model_timeout_is_task_failure() {
        let mut r = resources(Arc::new(HangingModel), Arc::new(InMemoryStore::new(10)));
        r.params.timeout = Duration::from_millis(20);
        let task = Task::new(Role::Generation, "hello");
        let result = GenerationWorker.execute(&task, &r).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionTimeout));
        assert!(result.suggestion.is_none());
    }
}
