//! 语言模型抽象
//!
//! 所有后端实现 LanguageModel::generate；调用方统一经 `generate_with_timeout` 施加超时。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::LlmSection;

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model backend error: {0}")]
    Backend(String),
}

/// 生成参数
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self::from_config(&LlmSection::default())
    }
}

impl GenerateParams {
    pub fn from_config(cfg: &LlmSection) -> Self {
        Self {
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

/// 语言模型 trait
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// 模型标识
    fn model_id(&self) -> &str;

    async fn generate(&self, prompt: &str, params: &GenerateParams) -> Result<String, LlmError>;
}

/// 在 params.timeout 内调用模型；超时返回 LlmError::Timeout
pub async fn generate_with_timeout(
    model: &dyn LanguageModel,
    prompt: &str,
    params: &GenerateParams,
) -> Result<String, LlmError> {
    tokio::time::timeout(params.timeout, model.generate(prompt, params))
        .await
        .map_err(|_| LlmError::Timeout(params.timeout))?
}
