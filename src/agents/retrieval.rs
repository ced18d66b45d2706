//! 上下文检索：从租户记忆中取回与请求相关的条目

use async_trait::async_trait;

use crate::agents::{ResolvedResources, ResourceNeeds, Worker};
use crate::core::{ErrorKind, Role, Task, TaskResult};

#[derive(Debug, Default, Clone)]
pub struct RetrievalWorker;

#[async_trait]
impl Worker for RetrievalWorker {
    fn role(&self) -> Role {
        Role::ContextRetrieval
    }

    fn needs(&self) -> ResourceNeeds {
        ResourceNeeds {
            model: false,
            memory: true,
        }
    }

    async fn execute(&self, task: &Task, resources: &ResolvedResources) -> TaskResult {
        let memory = match resources.memory() {
            Ok(m) => m,
            Err(e) => return TaskResult::failure(task.id, e),
        };
        match memory.search(&task.prompt, resources.search_limit).await {
            Ok(hits) if hits.is_empty() => TaskResult::success(task.id, ""),
            Ok(hits) => {
                tracing::debug!(task_id = %task.id, scope = %resources.scope, hits = hits.len(), "context retrieved");
                let lines: Vec<String> = hits.iter().map(|h| format!("- {}", h.content)).collect();
                TaskResult::success(task.id, lines.join("\n"))
            }
            Err(e) => TaskResult::fail(task.id, ErrorKind::ExecutionFailed, format!("memory search failed: {}", e)),
        }
    }
}
