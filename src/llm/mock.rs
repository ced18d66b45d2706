//! 离线模型（用于测试与本地运行，无需推理后端）
//!
//! - EchoLanguageModel：回显提示词最后一行，便于跑通编排流程；
//! - ScriptedLanguageModel：按提示词包含的关键字返回预设回复，测试中用来驱动动作建议。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::llm::{GenerateParams, LanguageModel, LlmError};

/// 回显模型
#[derive(Debug, Clone)]
pub struct EchoLanguageModel {
    id: String,
}

impl EchoLanguageModel {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for EchoLanguageModel {
    fn default() -> Self {
        Self::new("local-echo")
    }
}

#[async_trait]
impl LanguageModel for EchoLanguageModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, prompt: &str, _params: &GenerateParams) -> Result<String, LlmError> {
        let last = prompt
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("(no input)");
        Ok(format!("Echo from {}: {}", self.id, last.trim()))
    }
}

/// 脚本化模型：按规则顺序匹配提示词子串，首个命中的规则给出回复
#[derive(Debug)]
pub struct ScriptedLanguageModel {
    id: String,
    rules: Vec<(String, String)>,
    fallback: String,
    calls: AtomicUsize,
}

impl ScriptedLanguageModel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rules: Vec::new(),
            fallback: "OK".to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    /// 提示词包含 needle 时返回 response
    pub fn respond_when(mut self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push((needle.into(), response.into()));
        self
    }

    pub fn otherwise(mut self, response: impl Into<String>) -> Self {
        self.fallback = response.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedLanguageModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, prompt: &str, _params: &GenerateParams) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_else(|| self.fallback.clone());
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_first_match_wins() {
        let model = ScriptedLanguageModel::new("s")
            .respond_when("file", "A")
            .respond_when("out.txt", "B")
            .otherwise("C");
        let params = GenerateParams::default();
        assert_eq!(model.generate("create file out.txt", &params).await.unwrap(), "A");
        assert_eq!(model.generate("hello", &params).await.unwrap(), "C");
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_echo_last_line() {
        let model = EchoLanguageModel::default();
        let out = model
            .generate("system\n\nRequest: hi there\n", &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(out, "Echo from local-echo: Request: hi there");
    }
}
