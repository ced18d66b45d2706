//! 任务派发：按角色查找工作者并解析其所需资源；动作任务交给网关
//!
//! 每个请求一个 Dispatcher（绑定租户作用域与请求的取消 token），
//! 同时作为恢复引擎的 [`RecoveryDriver`]，纠正任务与重试复用同一条派发路径。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agents::{ResolvedResources, ResourceNeeds, WorkerRegistry};
use crate::cache::{SharedResources, TenantScope};
use crate::core::{
    ActionRequest, ActionSuggestion, EdgeKind, ErrorKind, Role, Task, TaskError, TaskId, TaskOrigin,
    TaskResult,
};
use crate::gateway::ActionGateway;
use crate::llm::GenerateParams;
use crate::recovery::{ExecutedTask, RecoveryDriver};

pub struct Dispatcher {
    workers: Arc<WorkerRegistry>,
    resources: Arc<SharedResources>,
    gateway: Arc<ActionGateway>,
    scope: TenantScope,
    actor: String,
    cancel: CancellationToken,
    task_timeout: Duration,
    search_limit: usize,
}

impl Dispatcher {
    pub fn new(
        workers: Arc<WorkerRegistry>,
        resources: Arc<SharedResources>,
        gateway: Arc<ActionGateway>,
        scope: TenantScope,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workers,
            resources,
            gateway,
            scope,
            actor: "hive".to_string(),
            cancel,
            task_timeout: Duration::from_secs(120),
            search_limit: 5,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// 工作者任务的墙钟上限；动作任务由网关自身的超时约束
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    /// 执行一个任务，恰好产生一个结果
    pub async fn run(&self, task: &Task) -> TaskResult {
        if self.cancel.is_cancelled() {
            return TaskResult::failure(task.id, TaskError::cancelled());
        }
        tracing::debug!(task_id = %task.id, role = %task.role, "dispatching task");
        let result = match task.role {
            Role::ToolExecution => self.run_action(task).await,
            _ => self.run_worker(task).await,
        };
        match &result.error {
            None => tracing::info!(task_id = %task.id, role = %task.role, "task completed"),
            Some(e) => tracing::warn!(task_id = %task.id, role = %task.role, kind = %e.kind, error = %e.message, "task failed"),
        }
        result
    }

    async fn run_action(&self, task: &Task) -> TaskResult {
        let Some(action) = task.action.clone() else {
            return TaskResult::fail(task.id, ErrorKind::ValidationRejected, "tool task carries no action");
        };
        let request = ActionRequest::new(action, Some(task.id), self.actor.clone());
        self.gateway
            .submit_with_cancel(request, &self.cancel)
            .await
            .into_task_result(task.id)
    }

    async fn run_worker(&self, task: &Task) -> TaskResult {
        let Some(worker) = self.workers.get(task.role) else {
            return TaskResult::fail(
                task.id,
                ErrorKind::ExecutionFailed,
                format!("no worker registered for role {}", task.role),
            );
        };
        let work = async {
            match self.resolve(worker.needs(), task.role).await {
                Ok(resources) => worker.execute(task, &resources).await,
                Err(e) => TaskResult::failure(task.id, e),
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => TaskResult::failure(task.id, TaskError::cancelled()),
            result = tokio::time::timeout(self.task_timeout, work) => result.unwrap_or_else(|_| {
                TaskResult::fail(
                    task.id,
                    ErrorKind::ExecutionTimeout,
                    format!("{} task exceeded {:?}", task.role, self.task_timeout),
                )
            }),
        }
    }

    async fn resolve(&self, needs: ResourceNeeds, role: Role) -> Result<ResolvedResources, TaskError> {
        let params = GenerateParams::from_config(self.resources.llm_config());
        let mut resolved = ResolvedResources::new(self.scope.clone(), params, self.search_limit);
        if needs.model {
            resolved.model = Some(self.resources.model_for(role).await?);
        }
        if needs.memory {
            resolved.memory = Some(self.resources.memory_for(&self.scope).await?);
        }
        Ok(resolved)
    }
}

#[async_trait]
impl RecoveryDriver for Dispatcher {
    async fn run_corrective(&self, task: Task) -> Vec<ExecutedTask> {
        let origin = task.origin;
        let mut executed = Vec::new();
        let mut next = Some(task);
        while let Some(task) = next.take() {
            let result = self.run(&task).await;
            // 工作者产出的编辑 / 安装建议同样作为纠正动作执行
            next = result
                .suggestion
                .clone()
                .map(|s| Task::action(s, origin).depends_on(task.id, EdgeKind::Required));
            executed.push(ExecutedTask::new(task, result));
        }
        executed
    }

    async fn retry_action(&self, origin: TaskId, action: ActionSuggestion) -> ExecutedTask {
        let task = Task::action(action, TaskOrigin::Recovery { for_task: origin });
        let result = self.run(&task).await;
        ExecutedTask::new(task, result)
    }
}
