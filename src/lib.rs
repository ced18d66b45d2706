//! Hive - Rust 多智能体编排运行时
//!
//! 模块划分：
//! - **core**: 任务模型、任务图构建、依赖调度、派发与请求取消
//! - **cache**: 通用资源缓存（单飞创建、空闲淘汰），模型与租户记忆两个实例
//! - **gateway**: 动作执行网关（风险分级、校验、确认、沙箱执行、审计）
//! - **recovery**: 动作失败后的诊断、策略、有界重试与熔断
//! - **agents**: 各角色工作者（检索、生成、调研、代码修改）
//! - **llm** / **memory** / **intent** / **web**: 外部能力接口与离线实现
//! - **runtime**: 对外入口（submit_request、缓存统计、审计查询、取消）
//! - **config**: 应用配置加载（TOML + 环境变量）

pub mod agents;
pub mod cache;
pub mod config;
pub mod core;
pub mod gateway;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod recovery;
pub mod runtime;
pub mod web;

pub use crate::core::{HiveError, RequestOutcome};
pub use runtime::{Runtime, RuntimeBuilder};
