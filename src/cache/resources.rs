//! 共享资源：两个缓存实例 + 加载器，供工作者按需解析模型与租户记忆
//!
//! 资源创建失败（ResourceUnavailable）退避后重试一次，仍失败则以结构化错误交还调度器。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::memory::memory_cache;
use crate::cache::models::model_cache;
use crate::cache::{
    CacheEntryStats, CacheError, MemoryCache, MemoryStoreProvider, ModelCache, ModelLoader,
    TenantScope,
};
use crate::config::{CacheSection, LlmSection};
use crate::core::{ErrorKind, HiveError, Role, TaskError};
use crate::llm::LanguageModel;
use crate::memory::MemoryStore;

pub const MODEL_CACHE: &str = "models";
pub const MEMORY_CACHE: &str = "memory";

/// 进程内唯一的共享资源服务，由 Runtime 持有并以引用传入调度器
pub struct SharedResources {
    models: Arc<ModelCache>,
    memories: Arc<MemoryCache>,
    loader: Arc<dyn ModelLoader>,
    provider: Arc<dyn MemoryStoreProvider>,
    llm: LlmSection,
    sweep_interval: Duration,
    retry_backoff: Duration,
}

impl SharedResources {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        provider: Arc<dyn MemoryStoreProvider>,
        cache_cfg: &CacheSection,
        llm: LlmSection,
    ) -> Self {
        let models = model_cache(Arc::clone(&loader))
            .with_max_idle(Duration::from_secs(cache_cfg.model_idle_secs))
            .with_evict_on_miss(cache_cfg.evict_on_miss);
        let memories = memory_cache(Arc::clone(&provider))
            .with_max_idle(Duration::from_secs(cache_cfg.memory_idle_secs))
            .with_evict_on_miss(cache_cfg.evict_on_miss);
        Self {
            models: Arc::new(models),
            memories: Arc::new(memories),
            loader,
            provider,
            llm,
            sweep_interval: Duration::from_secs(cache_cfg.sweep_interval_secs),
            retry_backoff: Duration::from_millis(cache_cfg.resource_retry_backoff_ms),
        }
    }

    pub fn llm_config(&self) -> &LlmSection {
        &self.llm
    }

    pub fn models(&self) -> &Arc<ModelCache> {
        &self.models
    }

    pub fn memories(&self) -> &Arc<MemoryCache> {
        &self.memories
    }

    /// 角色对应的模型句柄
    pub async fn model_for(&self, role: Role) -> Result<Arc<dyn LanguageModel>, TaskError> {
        let model_id = self.llm.model_for(role).to_string();
        let result = self.load_model(model_id.clone()).await;
        let result = match result {
            Ok(model) => Ok(model),
            Err(e) => {
                tracing::warn!(model = %model_id, error = %e, "model load failed, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                self.load_model(model_id).await
            }
        };
        result.map_err(unavailable)
    }

    /// 租户作用域的记忆句柄
    pub async fn memory_for(&self, scope: &TenantScope) -> Result<Arc<dyn MemoryStore>, TaskError> {
        let result = match self.open_memory(scope.clone()).await {
            Ok(store) => Ok(store),
            Err(e) => {
                tracing::warn!(scope = %scope, error = %e, "memory open failed, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                self.open_memory(scope.clone()).await
            }
        };
        result.map_err(unavailable)
    }

    async fn load_model(&self, model_id: String) -> Result<Arc<dyn LanguageModel>, CacheError> {
        let loader = Arc::clone(&self.loader);
        self.models
            .get_or_create(model_id, move |id: String| async move { loader.load(&id).await })
            .await
    }

    async fn open_memory(&self, scope: TenantScope) -> Result<Arc<dyn MemoryStore>, CacheError> {
        let provider = Arc::clone(&self.provider);
        self.memories
            .get_or_create(scope, move |s: TenantScope| async move { provider.open(&s).await })
            .await
    }

    /// 各缓存的条目统计
    pub fn stats(&self) -> BTreeMap<String, Vec<CacheEntryStats>> {
        BTreeMap::from([
            (MODEL_CACHE.to_string(), self.models.stats()),
            (MEMORY_CACHE.to_string(), self.memories.stats()),
        ])
    }

    pub fn force_evict(&self, cache_name: &str, key: &str) -> Result<bool, HiveError> {
        match cache_name {
            MODEL_CACHE => Ok(self.models.force_evict(&key.to_string())),
            MEMORY_CACHE => Ok(self.memories.force_evict_named(key)),
            other => Err(HiveError::UnknownCache(other.to_string())),
        }
    }

    /// 启动两个缓存的后台清扫任务
    pub fn spawn_sweepers(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.models.spawn_sweeper(self.sweep_interval, token.clone()),
            self.memories.spawn_sweeper(self.sweep_interval, token),
        ]
    }
}

fn unavailable(e: CacheError) -> TaskError {
    TaskError::new(ErrorKind::ResourceUnavailable, e.to_string())
}
