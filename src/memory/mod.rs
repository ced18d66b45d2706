//! 记忆层：按租户 + 项目隔离的检索存储

pub mod store;

pub use store::{InMemoryStore, MemoryHit, MemoryStore};
