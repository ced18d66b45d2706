//! 租户记忆缓存：按 (租户, 项目) 打开隔离的记忆存储，空闲后关闭

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::ResourceCache;
use crate::memory::{InMemoryStore, MemoryStore};

pub const DEFAULT_PROJECT: &str = "default";

/// 租户 + 项目组成的隔离作用域
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub tenant_id: String,
    pub project_id: String,
}

/// 仅保留字母数字、`-`、`_`，其余替换为 `-`
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "anonymous".to_string()
    } else {
        cleaned
    }
}

impl TenantScope {
    pub fn new(tenant_id: &str, project_id: Option<&str>) -> Self {
        Self {
            tenant_id: sanitize(tenant_id),
            project_id: sanitize(project_id.unwrap_or(DEFAULT_PROJECT)),
        }
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}__{}", self.tenant_id, self.project_id)
    }
}

/// 以租户作用域为键的缓存
pub type MemoryCache = ResourceCache<TenantScope, dyn MemoryStore>;

/// 记忆存储提供者：打开（或创建）某作用域的存储
#[async_trait]
pub trait MemoryStoreProvider: Send + Sync {
    async fn open(&self, scope: &TenantScope) -> Result<Arc<dyn MemoryStore>, String>;

    /// 淘汰时调用，默认落盘
    fn close(&self, _scope: &TenantScope, store: Arc<dyn MemoryStore>) {
        store.flush();
    }
}

/// 进程内提供者：各作用域的数据保存在后备表中，重新打开时恢复
pub struct InMemoryStoreProvider {
    backing: Mutex<HashMap<TenantScope, Arc<InMemoryStore>>>,
    max_entries: usize,
    opens: AtomicUsize,
}

impl InMemoryStoreProvider {
    pub fn new(max_entries: usize) -> Self {
        Self {
            backing: Mutex::new(HashMap::new()),
            max_entries,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryStoreProvider {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl MemoryStoreProvider for InMemoryStoreProvider {
    async fn open(&self, scope: &TenantScope) -> Result<Arc<dyn MemoryStore>, String> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mut backing = self.backing.lock().map_err(|e| e.to_string())?;
        let store = backing
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(InMemoryStore::new(self.max_entries)));
        tracing::debug!(scope = %scope, "memory store opened");
        Ok(Arc::clone(store) as Arc<dyn MemoryStore>)
    }
}

/// 构造租户记忆缓存，淘汰时通知提供者关闭
pub fn memory_cache(provider: Arc<dyn MemoryStoreProvider>) -> MemoryCache {
    ResourceCache::new("memory").with_teardown(Arc::new(
        move |scope: &TenantScope, store: Arc<dyn MemoryStore>| provider.close(scope, store),
    ))
}
