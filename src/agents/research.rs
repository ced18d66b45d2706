//! 网页调研：抓取提示词中的 URL（没有则走搜索地址），再由模型总结要点

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::{ResolvedResources, ResourceNeeds, Worker};
use crate::core::{ErrorKind, Role, Task, TaskResult};
use crate::web::{extract_url, search_url, WebFetcher};

/// 交给模型总结的抓取文本上限（字符）
const MAX_SOURCE_CHARS: usize = 6000;

pub struct WebResearchWorker {
    fetcher: Arc<dyn WebFetcher>,
    search_base: String,
}

impl WebResearchWorker {
    pub fn new(fetcher: Arc<dyn WebFetcher>, search_base: impl Into<String>) -> Self {
        Self {
            fetcher,
            search_base: search_base.into(),
        }
    }

    fn target(&self, task: &Task) -> Result<String, String> {
        match extract_url(&task.prompt) {
            Some(url) => Ok(url),
            None => search_url(&self.search_base, task.prompt.trim()),
        }
    }
}

#[async_trait]
impl Worker for WebResearchWorker {
    fn role(&self) -> Role {
        Role::WebResearch
    }

    fn needs(&self) -> ResourceNeeds {
        ResourceNeeds {
            model: true,
            memory: false,
        }
    }

    async fn execute(&self, task: &Task, resources: &ResolvedResources) -> TaskResult {
        let url = match self.target(task) {
            Ok(url) => url,
            Err(e) => return TaskResult::fail(task.id, ErrorKind::ExecutionFailed, e),
        };
        let page = match self.fetcher.fetch(&url).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(task_id = %task.id, url = %url, error = %e, "research fetch failed");
                return TaskResult::fail(task.id, ErrorKind::ExecutionFailed, format!("fetch {}: {}", url, e));
            }
        };
        let source: String = page.chars().take(MAX_SOURCE_CHARS).collect();
        let prompt = format!(
            "Summarize the findings relevant to the question in a few bullet points.\n\
             Source ({}):\n{}\n\nQuestion:\n{}",
            url, source, task.prompt
        );
        match resources.generate(&prompt).await {
            Ok(summary) => TaskResult::success(task.id, format!("Source: {}\n{}", url, summary.trim())),
            Err(e) => TaskResult::failure(task.id, e),
        }
    }
}
