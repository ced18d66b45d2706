//! 模型缓存：按模型 ID 惰性加载，空闲后卸载

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::ResourceCache;
use crate::llm::{EchoLanguageModel, LanguageModel};

/// 以模型 ID 为键的缓存
pub type ModelCache = ResourceCache<String, dyn LanguageModel>;

/// 模型加载器：加载权重 / 建立推理会话
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn LanguageModel>, String>;

    /// 淘汰时调用（默认无操作）
    fn unload(&self, _model_id: &str) {}
}

/// 预注册模型的加载器；未注册的 ID 可选回退到回显模型
pub struct RegistryModelLoader {
    models: HashMap<String, Arc<dyn LanguageModel>>,
    echo_fallback: bool,
    loads: AtomicUsize,
    unloads: AtomicUsize,
}

impl RegistryModelLoader {
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
            echo_fallback: false,
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        self.models.insert(model_id.into(), model);
        self
    }

    /// 未注册的模型 ID 使用 EchoLanguageModel
    pub fn with_echo_fallback(mut self) -> Self {
        self.echo_fallback = true;
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

impl Default for RegistryModelLoader {
    fn default() -> Self {
        Self::new().with_echo_fallback()
    }
}

#[async_trait]
impl ModelLoader for RegistryModelLoader {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn LanguageModel>, String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(model) = self.models.get(model_id) {
            return Ok(Arc::clone(model));
        }
        if self.echo_fallback {
            return Ok(Arc::new(EchoLanguageModel::new(model_id)));
        }
        Err(format!("Unknown model: {}", model_id))
    }

    fn unload(&self, model_id: &str) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        tracing::info!(model = %model_id, "model unloaded");
    }
}

/// 构造模型缓存，淘汰时通知加载器卸载
pub fn model_cache(loader: Arc<dyn ModelLoader>) -> ModelCache {
    ResourceCache::new("models").with_teardown(Arc::new(move |id: &String, _model: Arc<dyn LanguageModel>| {
        loader.unload(id)
    }))
}
