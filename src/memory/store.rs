//! 租户记忆存储
//!
//! MemoryStore 句柄本身即作用域（每个租户 + 项目一个实例，由 ResourceCache 管理生命周期）。
//! InMemoryStore 按关键词重叠打分，真实向量检索由外部绑定实现。

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 检索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub content: String,
    pub score: f32,
    pub metadata: BTreeMap<String, String>,
}

/// 记忆存储 trait：写入与排序检索
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>, String>;

    async fn add(&self, content: &str, metadata: BTreeMap<String, String>) -> Result<(), String>;

    /// 关闭前落盘（默认无操作）
    fn flush(&self) {}
}

struct Entry {
    content: String,
    tokens: HashSet<String>,
    metadata: BTreeMap<String, String>,
}

/// 简单内存实现：按关键词重叠检索
pub struct InMemoryStore {
    entries: RwLock<Vec<Entry>>,
    max_entries: usize,
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

impl InMemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>, String> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().map_err(|e| e.to_string())?;
        let mut scored: Vec<MemoryHit> = entries
            .iter()
            .filter_map(|e| {
                let overlap = query_tokens.intersection(&e.tokens).count();
                (overlap > 0).then(|| MemoryHit {
                    content: e.content.clone(),
                    score: overlap as f32 / query_tokens.len() as f32,
                    metadata: e.metadata.clone(),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn add(&self, content: &str, metadata: BTreeMap<String, String>) -> Result<(), String> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.write().map_err(|e| e.to_string())?;
        entries.push(Entry {
            content: content.to_string(),
            tokens: tokenize_lower(content),
            metadata,
        });
        let n = entries.len();
        if n > self.max_entries {
            entries.drain(0..n - self.max_entries);
        }
        Ok(())
    }
}
