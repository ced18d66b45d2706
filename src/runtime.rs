//! 运行时：进程内唯一的服务结构，持有共享资源、网关、恢复引擎与工作者注册表
//!
//! 对外接口：
//! - `submit_request(text, tenant_id, project_id)`：分类 → 构建任务图 → 调度 → 聚合结果；
//! - `get_cache_stats()` / `force_evict(cache, key)`：两个 ResourceCache 的统计与强制淘汰；
//! - `get_audit_log(filter)`：查询审计记录；
//! - `cancel(request_id)` / `cancel_all()`：取消进行中的请求。
//!
//! 能力（模型加载、记忆存储、分类器、确认通道、进程执行、审计存储、网页抓取）均可经
//! [`RuntimeBuilder`] 注入；未注入时使用离线默认实现。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{CodeEditWorker, GenerationWorker, RetrievalWorker, WebResearchWorker, Worker, WorkerRegistry};
use crate::cache::{
    CacheEntryStats, InMemoryStoreProvider, MemoryStoreProvider, ModelLoader, RegistryModelLoader,
    SharedResources, TenantScope,
};
use crate::config::AppConfig;
use crate::core::{Dispatcher, HiveError, RequestOutcome, RequestSupervisor, Scheduler, TaskGraphBuilder};
use crate::gateway::{
    ActionGateway, AuditEvent, AuditFilter, AuditSink, ConfirmationChannel, DenyAllConfirmation,
    InMemoryAuditSink, ProcessRunner, SqliteAuditSink, TokioProcessRunner,
};
use crate::intent::{Classification, Classifier, KeywordClassifier};
use crate::recovery::{CircuitBreakerState, RecoveryEngine};
use crate::web::{HttpFetcher, WebFetcher};

/// 运行时构建器
pub struct RuntimeBuilder {
    config: AppConfig,
    classifier: Option<Arc<dyn Classifier>>,
    error_classifier: Option<Arc<dyn Classifier>>,
    model_loader: Option<Arc<dyn ModelLoader>>,
    memory_provider: Option<Arc<dyn MemoryStoreProvider>>,
    confirmation: Option<Arc<dyn ConfirmationChannel>>,
    runner: Option<Arc<dyn ProcessRunner>>,
    audit: Option<Arc<dyn AuditSink>>,
    fetcher: Option<Arc<dyn WebFetcher>>,
    extra_workers: Vec<Arc<dyn Worker>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            classifier: None,
            error_classifier: None,
            model_loader: None,
            memory_provider: None,
            confirmation: None,
            runner: None,
            audit: None,
            fetcher: None,
            extra_workers: Vec::new(),
        }
    }

    /// 意图分类器（默认关键词规则）
    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// 恢复引擎在模式未命中时使用的错误分类器
    pub fn error_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.error_classifier = Some(classifier);
        self
    }

    pub fn model_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.model_loader = Some(loader);
        self
    }

    pub fn memory_provider(mut self, provider: Arc<dyn MemoryStoreProvider>) -> Self {
        self.memory_provider = Some(provider);
        self
    }

    /// 确认通道（默认全部拒绝）
    pub fn confirmation(mut self, channel: Arc<dyn ConfirmationChannel>) -> Self {
        self.confirmation = Some(channel);
        self
    }

    pub fn process_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// 审计存储（默认按 gateway.audit_db 选择 SQLite 或内存）
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn web_fetcher(mut self, fetcher: Arc<dyn WebFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// 覆盖或追加某个角色的工作者
    pub fn worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.extra_workers.push(worker);
        self
    }

    pub fn build(self) -> Result<Runtime, HiveError> {
        let cfg = self.config;
        let root = cfg.app.workspace();
        std::fs::create_dir_all(&root)?;

        let audit: Arc<dyn AuditSink> = match (self.audit, &cfg.gateway.audit_db) {
            (Some(sink), _) => sink,
            (None, Some(path)) => Arc::new(SqliteAuditSink::open(path)?),
            (None, None) => Arc::new(InMemoryAuditSink::new()),
        };

        let resources = SharedResources::new(
            self.model_loader
                .unwrap_or_else(|| Arc::new(RegistryModelLoader::default())),
            self.memory_provider
                .unwrap_or_else(|| Arc::new(InMemoryStoreProvider::new(cfg.memory.max_entries))),
            &cfg.cache,
            cfg.llm.clone(),
        );

        let gateway = ActionGateway::new(
            &cfg.gateway,
            &root,
            self.runner
                .unwrap_or_else(|| Arc::new(TokioProcessRunner::new(cfg.gateway.max_output_bytes))),
            self.confirmation
                .unwrap_or_else(|| Arc::new(DenyAllConfirmation)),
            Arc::clone(&audit),
        );

        let mut recovery = RecoveryEngine::new(&cfg.recovery, Arc::clone(&audit), cfg.app.actor.clone());
        if let Some(classifier) = self.error_classifier {
            recovery = recovery.with_classifier(classifier, cfg.recovery.classifier_min_confidence);
        }

        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpFetcher::from_config(&cfg.web)));
        let mut workers = WorkerRegistry::new();
        workers.register(RetrievalWorker);
        workers.register(GenerationWorker);
        workers.register(CodeEditWorker);
        workers.register(WebResearchWorker::new(fetcher, cfg.web.search_url.clone()));
        for worker in self.extra_workers {
            workers.register_arc(worker);
        }

        let planner = TaskGraphBuilder::from_config(&cfg.routing).with_available_roles(workers.roles());
        if let Some(missing) = planner
            .fallback()
            .and_then(|steps| steps.iter().find(|s| !workers.contains(s.role)))
        {
            return Err(HiveError::UnknownRole(missing.role));
        }

        tracing::info!(
            workspace = %root.display(),
            roles = ?workers.roles(),
            max_concurrent = cfg.app.max_concurrent_tasks,
            "runtime built"
        );

        Ok(Runtime {
            classifier: self
                .classifier
                .unwrap_or_else(|| Arc::new(KeywordClassifier::default())),
            planner,
            workers: Arc::new(workers),
            resources: Arc::new(resources),
            gateway: Arc::new(gateway),
            recovery: Arc::new(recovery),
            audit,
            supervisor: RequestSupervisor::new(),
            background: CancellationToken::new(),
            config: cfg,
        })
    }
}

/// 编排运行时
pub struct Runtime {
    config: AppConfig,
    classifier: Arc<dyn Classifier>,
    planner: TaskGraphBuilder,
    workers: Arc<WorkerRegistry>,
    resources: Arc<SharedResources>,
    gateway: Arc<ActionGateway>,
    recovery: Arc<RecoveryEngine>,
    audit: Arc<dyn AuditSink>,
    supervisor: RequestSupervisor,
    background: CancellationToken,
}

impl Runtime {
    pub fn builder(config: AppConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 端到端入口：生成请求 ID 后执行
    pub async fn submit_request(
        &self,
        text: &str,
        tenant_id: &str,
        project_id: Option<&str>,
    ) -> Result<RequestOutcome, HiveError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.submit_request_as(&request_id, text, tenant_id, project_id)
            .await
    }

    /// 以调用方给定的请求 ID 执行，便于在请求进行中调用 [`Runtime::cancel`]
    pub async fn submit_request_as(
        &self,
        request_id: &str,
        text: &str,
        tenant_id: &str,
        project_id: Option<&str>,
    ) -> Result<RequestOutcome, HiveError> {
        let intent = match self.classifier.classify(text).await {
            Ok(intent) => intent,
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "intent classification failed");
                Classification::unknown()
            }
        };
        let graph = self.planner.build(text, &intent)?;
        let scope = TenantScope::new(tenant_id, project_id);
        tracing::info!(
            request_id = %request_id,
            scope = %scope,
            intent = %intent.label,
            confidence = intent.confidence,
            "request accepted"
        );

        let cancel = self.supervisor.begin(request_id);
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.workers),
            Arc::clone(&self.resources),
            Arc::clone(&self.gateway),
            scope,
            cancel,
        )
        .with_actor(self.config.app.actor.clone())
        .with_task_timeout(Duration::from_secs(self.config.app.task_timeout_secs))
        .with_search_limit(self.config.memory.search_limit);
        let scheduler = Scheduler::new(
            Arc::new(dispatcher),
            Arc::clone(&self.recovery),
            self.config.app.max_concurrent_tasks,
        );
        let outcome = scheduler.run(request_id.to_string(), intent, graph).await;
        self.supervisor.finish(request_id);
        Ok(outcome)
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        self.supervisor.cancel(request_id)
    }

    pub fn cancel_all(&self) {
        self.supervisor.cancel_all()
    }

    pub fn active_requests(&self) -> Vec<String> {
        self.supervisor.active()
    }

    /// 每个缓存的条目统计（键、空闲时长、是否在用）
    pub fn get_cache_stats(&self) -> BTreeMap<String, Vec<CacheEntryStats>> {
        self.resources.stats()
    }

    pub fn force_evict(&self, cache_name: &str, key: &str) -> Result<bool, HiveError> {
        self.resources.force_evict(cache_name, key)
    }

    pub fn get_audit_log(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, HiveError> {
        Ok(self.audit.query(filter)?)
    }

    pub fn breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.recovery.breaker().states()
    }

    /// 网关与恢复两处审计写入失败的累计次数
    pub fn audit_failures(&self) -> u64 {
        self.gateway.audit_failures() + self.recovery.audit_failures()
    }

    pub fn gateway(&self) -> &ActionGateway {
        &self.gateway
    }

    pub fn resources(&self) -> &SharedResources {
        &self.resources
    }

    /// 启动后台清扫任务，直到 shutdown
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        self.resources.spawn_sweepers(self.background.child_token())
    }

    /// 停止后台任务并取消全部请求
    pub fn shutdown(&self) {
        tracing::info!("runtime shutting down");
        self.background.cancel();
        self.supervisor.shutdown();
    }
}
