//! 通用资源缓存：惰性创建、单飞（single-flight）、空闲淘汰
//!
//! 同一键的并发请求只会触发一次 factory：首个请求者放入 Loading 占位并在独立的 tokio 任务中创建，
//! 其余请求者订阅同一个 watch 通道等待结果。创建任务与请求者解耦，请求者取消不会中断创建。
//! factory 失败时占位被清除，错误广播给所有等待者，不留下半成品。
//!
//! 模型缓存与租户记忆缓存是它的两个实例（见 `models` / `memory`）。

pub mod memory;
pub mod models;
pub mod resources;

pub use memory::{InMemoryStoreProvider, MemoryCache, MemoryStoreProvider, TenantScope};
pub use models::{ModelCache, ModelLoader, RegistryModelLoader};
pub use resources::{SharedResources, MEMORY_CACHE, MODEL_CACHE};

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 缓存错误（可克隆：一次创建失败需要分发给所有等待者）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Failed to create '{key}' in cache '{cache}': {message}")]
    Creation {
        cache: String,
        key: String,
        message: String,
    },

    #[error("Creation of '{key}' in cache '{cache}' was abandoned")]
    Abandoned { cache: String, key: String },
}

type Outcome<V> = Option<Result<Arc<V>, CacheError>>;

/// 淘汰回调：模型卸载 / 存储落盘
pub type Teardown<K, V> = Arc<dyn Fn(&K, Arc<V>) + Send + Sync>;

enum Slot<V: ?Sized> {
    Ready {
        handle: Arc<V>,
        last_access: Instant,
        created_at: Instant,
    },
    Loading {
        rx: watch::Receiver<Outcome<V>>,
        started_at: Instant,
    },
}

/// 单个缓存项的统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntryStats {
    pub key: String,
    /// 距上次访问的毫秒数（创建中为 0）
    pub idle_ms: u64,
    pub age_ms: u64,
    /// 缓存之外仍有持有者
    pub in_use: bool,
    pub loading: bool,
}

/// 通用键控资源缓存
pub struct ResourceCache<K, V: ?Sized> {
    name: String,
    slots: Arc<Mutex<HashMap<K, Slot<V>>>>,
    /// 超过该空闲时长的项视为过期：get_or_create 重新创建，sweep 淘汰
    max_idle: Option<Duration>,
    evict_on_miss: bool,
    teardown: Option<Teardown<K, V>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K, V> ResourceCache<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: ?Sized + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Arc::new(Mutex::new(HashMap::new())),
            max_idle: None,
            evict_on_miss: false,
            teardown: None,
        }
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    /// 未命中时先淘汰过期项
    pub fn with_evict_on_miss(mut self, enabled: bool) -> Self {
        self.evict_on_miss = enabled;
        self
    }

    pub fn with_teardown(mut self, teardown: Teardown<K, V>) -> Self {
        self.teardown = Some(teardown);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_idle(&self) -> Option<Duration> {
        self.max_idle
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.slots).contains_key(key)
    }

    /// 取缓存句柄，未命中或已过期时创建；并发的同键请求共享同一次创建
    pub async fn get_or_create<F, Fut>(&self, key: K, factory: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<V>, String>> + Send + 'static,
    {
        if self.evict_on_miss && !self.contains(&key) {
            self.sweep();
        }

        let (rx, expired) = {
            let mut slots = lock(&self.slots);
            let waiting = match slots.get_mut(&key) {
                Some(Slot::Ready {
                    handle,
                    last_access,
                    ..
                }) => {
                    if self.max_idle.map_or(true, |max| last_access.elapsed() <= max) {
                        *last_access = Instant::now();
                        return Ok(Arc::clone(handle));
                    }
                    None
                }
                Some(Slot::Loading { rx, .. }) => Some(rx.clone()),
                None => None,
            };
            match waiting {
                Some(rx) => (rx, None),
                None => {
                    let expired = match slots.remove(&key) {
                        Some(Slot::Ready { handle, .. }) => Some(handle),
                        _ => None,
                    };
                    let (tx, rx) = watch::channel(None);
                    slots.insert(
                        key.clone(),
                        Slot::Loading {
                            rx: rx.clone(),
                            started_at: Instant::now(),
                        },
                    );
                    self.spawn_creation(key.clone(), factory, tx);
                    (rx, expired)
                }
            }
        };

        if let Some(handle) = expired {
            tracing::info!(cache = %self.name, key = %key, "expired entry replaced");
            self.run_teardown(&key, handle);
        }
        self.await_creation(&key, rx).await
    }

    /// 在独立任务中运行 factory；factory 再嵌套一层 spawn，panic 也能转为错误
    fn spawn_creation<F, Fut>(&self, key: K, factory: F, tx: watch::Sender<Outcome<V>>)
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<V>, String>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let cache = self.name.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let created = tokio::spawn(factory(key.clone())).await;
            let outcome = match created {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(message)) => Err(CacheError::Creation {
                    cache: cache.clone(),
                    key: key.to_string(),
                    message,
                }),
                Err(join) => Err(CacheError::Creation {
                    cache: cache.clone(),
                    key: key.to_string(),
                    message: format!("factory aborted: {}", join),
                }),
            };
            {
                let mut slots = lock(&slots);
                match &outcome {
                    Ok(handle) => {
                        let now = Instant::now();
                        slots.insert(
                            key.clone(),
                            Slot::Ready {
                                handle: Arc::clone(handle),
                                last_access: now,
                                created_at: now,
                            },
                        );
                    }
                    Err(_) => {
                        slots.remove(&key);
                    }
                }
            }
            match &outcome {
                Ok(_) => tracing::info!(
                    cache = %cache,
                    key = %key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "resource created"
                ),
                Err(e) => tracing::warn!(cache = %cache, key = %key, error = %e, "resource creation failed"),
            }
            let _ = tx.send(Some(outcome));
        });
    }

    async fn await_creation(
        &self,
        key: &K,
        mut rx: watch::Receiver<Outcome<V>>,
    ) -> Result<Arc<V>, CacheError> {
        let abandoned = || CacheError::Abandoned {
            cache: self.name.clone(),
            key: key.to_string(),
        };
        let outcome = match rx.wait_for(|v| v.is_some()).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(abandoned()))
    }

    /// 淘汰空闲超过 max_idle 的项（创建中的项不受影响），返回淘汰数
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let evicted: Vec<(K, Arc<V>)> = {
            let mut slots = lock(&self.slots);
            let stale: Vec<K> = slots
                .iter()
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready { last_access, .. } if last_access.elapsed() > max_idle => {
                        Some(k.clone())
                    }
                    _ => None,
                })
                .collect();
            stale
                .into_iter()
                .filter_map(|k| match slots.remove(&k) {
                    Some(Slot::Ready { handle, .. }) => Some((k, handle)),
                    _ => None,
                })
                .collect()
        };
        let count = evicted.len();
        for (key, handle) in evicted {
            tracing::info!(cache = %self.name, key = %key, "idle entry evicted");
            self.run_teardown(&key, handle);
        }
        count
    }

    /// 按配置的 max_idle 清扫；未配置时不做任何事
    pub fn sweep(&self) -> usize {
        self.max_idle.map(|idle| self.evict_idle(idle)).unwrap_or(0)
    }

    /// 强制淘汰指定键；不存在或正在创建时返回 false
    pub fn force_evict(&self, key: &K) -> bool {
        let removed = {
            let mut slots = lock(&self.slots);
            match slots.get(key) {
                Some(Slot::Ready { .. }) => match slots.remove(key) {
                    Some(Slot::Ready { handle, .. }) => Some(handle),
                    _ => None,
                },
                _ => None,
            }
        };
        match removed {
            Some(handle) => {
                tracing::info!(cache = %self.name, key = %key, "entry force-evicted");
                self.run_teardown(key, handle);
                true
            }
            None => false,
        }
    }

    /// 按键的展示形式强制淘汰（供外部 API 使用）
    pub fn force_evict_named(&self, key: &str) -> bool {
        let found = lock(&self.slots).keys().find(|k| k.to_string() == key).cloned();
        found.map(|k| self.force_evict(&k)).unwrap_or(false)
    }

    pub fn stats(&self) -> Vec<CacheEntryStats> {
        let slots = lock(&self.slots);
        let mut stats: Vec<CacheEntryStats> = slots
            .iter()
            .map(|(k, slot)| match slot {
                Slot::Ready {
                    handle,
                    last_access,
                    created_at,
                } => CacheEntryStats {
                    key: k.to_string(),
                    idle_ms: last_access.elapsed().as_millis() as u64,
                    age_ms: created_at.elapsed().as_millis() as u64,
                    in_use: Arc::strong_count(handle) > 1,
                    loading: false,
                },
                Slot::Loading { started_at, .. } => CacheEntryStats {
                    key: k.to_string(),
                    idle_ms: 0,
                    age_ms: started_at.elapsed().as_millis() as u64,
                    in_use: true,
                    loading: true,
                },
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    fn run_teardown(&self, key: &K, handle: Arc<V>) {
        if let Some(teardown) = &self.teardown {
            teardown(key, handle);
        }
    }

    /// 后台周期清扫，token 取消时退出
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = cache.sweep();
                        if evicted > 0 {
                            tracing::debug!(cache = %cache.name, evicted, "sweep finished");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_factory(
        counter: Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl FnOnce(String) -> std::pin::Pin<Box<dyn Future<Output = Result<Arc<String>, String>> + Send>>
           + Send
           + 'static {
        move |key: String| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(Arc::new(format!("handle:{}", key)))
            })
        }
    }

    #[tokio::test]
    async fn test_single_flight_concurrent_callers() {
        let cache: Arc<ResourceCache<String, String>> = Arc::new(ResourceCache::new("models"));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create(
                        "m1".to_string(),
                        counting_factory(counter, Duration::from_millis(50)),
                    )
                    .await
            }));
        }
        let results: Vec<Arc<String>> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|h| Arc::ptr_eq(h, &results[0])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_create_independently() {
        let cache: ResourceCache<String, String> = ResourceCache::new("models");
        let counter = Arc::new(AtomicUsize::new(0));
        let a = cache.get_or_create("a".into(), counting_factory(counter.clone(), Duration::ZERO));
        let b = cache.get_or_create("b".into(), counting_factory(counter.clone(), Duration::ZERO));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(*a.unwrap(), "handle:a");
        assert_eq!(*b.unwrap(), "handle:b");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_factory_error_reaches_all_waiters_and_clears_slot() {
        let cache: Arc<ResourceCache<String, String>> = Arc::new(ResourceCache::new("memory"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create("broken".to_string(), |_key: String| async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err::<Arc<String>, String>("disk full".to_string())
                    })
                    .await
            }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(err, CacheError::Creation { ref message, .. } if message == "disk full"));
        }
        assert!(!cache.contains(&"broken".to_string()));

        // 失败不留残留：下次请求重新创建
        let ok = cache
            .get_or_create("broken".to_string(), |k: String| async move { Ok(Arc::new(k)) })
            .await
            .unwrap();
        assert_eq!(*ok, "broken");
    }

    #[tokio::test]
    async fn test_factory_panic_becomes_error() {
        let cache: ResourceCache<String, String> = ResourceCache::new("models");
        let err = cache
            .get_or_create("p".to_string(), |_k: String| async {
                if true {
                    panic!("weights corrupted");
                }
                Ok(Arc::new(String::new()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Creation { .. }));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_requester_cancel_does_not_abort_creation() {
        let cache: Arc<ResourceCache<String, String>> = Arc::new(ResourceCache::new("models"));
        let counter = Arc::new(AtomicUsize::new(0));

        let first = {
            let cache = Arc::clone(&cache);
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                cache
                    .get_or_create("m".to_string(), counting_factory(counter, Duration::from_millis(80)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        let second = cache
            .get_or_create("m".to_string(), counting_factory(counter.clone(), Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(*second, "handle:m");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_eviction_keeps_recent_entries() {
        let torn_down = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = Arc::clone(&torn_down);
        let cache: ResourceCache<String, String> = ResourceCache::new("memory").with_teardown(Arc::new(
            move |k: &String, _h: Arc<String>| lock(&log).push(k.clone()),
        ));

        cache
            .get_or_create("old".to_string(), |k: String| async move { Ok(Arc::new(k)) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        cache
            .get_or_create("fresh".to_string(), |k: String| async move { Ok(Arc::new(k)) })
            .await
            .unwrap();

        let evicted = cache.evict_idle(Duration::from_millis(60));
        assert_eq!(evicted, 1);
        assert!(!cache.contains(&"old".to_string()));
        assert!(cache.contains(&"fresh".to_string()));
        assert_eq!(*lock(&torn_down), vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn test_access_refreshes_last_access() {
        let cache: ResourceCache<String, String> = ResourceCache::new("models");
        cache
            .get_or_create("k".to_string(), |k: String| async move { Ok(Arc::new(k)) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        cache
            .get_or_create("k".to_string(), |_k: String| async move {
                Err::<Arc<String>, String>("must not be called".into())
            })
            .await
            .unwrap();
        assert_eq!(cache.evict_idle(Duration::from_millis(60)), 0);
    }

    #[tokio::test]
    async fn test_loading_entries_are_never_evicted() {
        let cache: Arc<ResourceCache<String, String>> = Arc::new(ResourceCache::new("models"));
        let counter = Arc::new(AtomicUsize::new(0));
        let pending = {
            let cache = Arc::clone(&cache);
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                cache
                    .get_or_create("slow".to_string(), counting_factory(counter, Duration::from_millis(60)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.evict_idle(Duration::ZERO), 0);
        assert!(!cache.force_evict(&"slow".to_string()));
        assert!(cache.stats()[0].loading);
        assert_eq!(*pending.await.unwrap().unwrap(), "handle:slow");
    }

    #[tokio::test]
    async fn test_force_evict_and_stats() {
        let cache: ResourceCache<String, String> = ResourceCache::new("models");
        let held = cache
            .get_or_create("a".to_string(), |k: String| async move { Ok(Arc::new(k)) })
            .await
            .unwrap();
        cache
            .get_or_create("b".to_string(), |k: String| async move { Ok(Arc::new(k)) })
            .await
            .unwrap();

        let stats = cache.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].key, "a");
        assert!(stats[0].in_use);
        assert!(!stats[1].in_use);

        assert!(cache.force_evict_named("b"));
        assert!(!cache.force_evict(&"b".to_string()));
        assert!(cache.force_evict(&"a".to_string()));
        assert_eq!(*held, "a");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entry_is_recreated() {
        let cache: ResourceCache<String, String> =
            ResourceCache::new("models").with_max_idle(Duration::from_millis(30));
        let counter = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_create("k".into(), counting_factory(counter.clone(), Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache
            .get_or_create("k".into(), counting_factory(counter.clone(), Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let cache: Arc<ResourceCache<String, String>> =
            Arc::new(ResourceCache::new("memory").with_max_idle(Duration::from_millis(20)));
        cache
            .get_or_create("t".into(), |k: String| async move { Ok(Arc::new(k)) })
            .await
            .unwrap();
        let token = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(Duration::from_millis(15), token.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());
        token.cancel();
        sweeper.await.unwrap();
    }
}
