//! 意图分类
//!
//! Classifier 是黑盒能力：输入文本，输出 (标签, 置信度)。
//! 路由表与任务图构建只依赖该接口，不关心当前启用的是关键词规则还是模型分类。

pub mod classifier;

pub use classifier::{KeywordClassifier, ModelClassifier};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

impl Classification {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// 无法分类
    pub fn unknown() -> Self {
        Self::new("unknown", 0.0)
    }
}

/// 分类器 trait
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, String>;
}
