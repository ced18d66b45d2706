//! 分类器实现
//!
//! - KeywordClassifier：快速规则匹配（不调用模型）；
//! - ModelClassifier：先走可选的规则快速路径，未命中再调用模型输出 JSON 标签。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::intent::{Classification, Classifier};
use crate::llm::{generate_with_timeout, GenerateParams, LanguageModel};

const KEYWORD_CONFIDENCE: f32 = 0.9;

/// 关键词规则分类器：按规则顺序，首个命中的标签胜出
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<(String, Vec<String>)>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// 追加规则；含空格或非 ASCII 的关键词按子串匹配，其余按整词匹配
    pub fn rule<I, S>(mut self, label: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.into().to_lowercase())
            .collect();
        self.rules.push((label.into(), keywords));
        self
    }

    fn fast_match(&self, input: &str) -> Option<&str> {
        let lower = input.to_lowercase();
        let words: HashSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .collect();
        self.rules
            .iter()
            .find(|(_, keywords)| {
                keywords.iter().any(|k| {
                    if k.contains(' ') || !k.is_ascii() || k.contains("://") {
                        lower.contains(k.as_str())
                    } else {
                        words.contains(k.as_str())
                    }
                })
            })
            .map(|(label, _)| label.as_str())
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
            .rule(
                "research",
                ["search", "look up", "research", "http://", "https://", "搜索", "查一下", "帮我查"],
            )
            .rule(
                "file_operation",
                [
                    "create a file", "create file", "write a file", "write file", "file named",
                    "read file", "list files", "创建文件", "写入文件", "读取文件",
                ],
            )
            .rule(
                "command",
                ["run", "execute", "install", "运行", "执行", "安装"],
            )
            .rule(
                "code",
                ["code", "function", "bug", "refactor", "compile", "fix", "代码", "函数", "重构"],
            )
            .rule("chat", ["hello", "hi", "thanks", "你好", "谢谢"])
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, String> {
        Ok(match self.fast_match(text) {
            Some(label) => Classification::new(label, KEYWORD_CONFIDENCE),
            None => Classification::unknown(),
        })
    }
}

#[derive(Deserialize)]
struct LabelReply {
    label: String,
    #[serde(default = "default_reply_confidence")]
    confidence: f32,
}

fn default_reply_confidence() -> f32 {
    0.5
}

/// 模型分类器：限定候选标签，解析模型输出的 JSON
pub struct ModelClassifier {
    model: Arc<dyn LanguageModel>,
    labels: Vec<String>,
    params: GenerateParams,
    fast_path: Option<KeywordClassifier>,
}

impl ModelClassifier {
    pub fn new(model: Arc<dyn LanguageModel>, labels: Vec<String>, params: GenerateParams) -> Self {
        Self {
            model,
            labels,
            params,
            fast_path: None,
        }
    }

    /// 先用关键词规则，未命中再调用模型
    pub fn with_fast_path(mut self, keywords: KeywordClassifier) -> Self {
        self.fast_path = Some(keywords);
        self
    }

    fn prompt(&self, text: &str) -> String {
        format!(
            "Classify the input into exactly one of these labels: {}.\n\
             Reply with one JSON object only: {{\"label\": \"<label>\", \"confidence\": <0..1>}}\n\n\
             Input:\n{}",
            self.labels.join(", "),
            text
        )
    }

    /// 提取 JSON 对象；失败时在文本中查找候选标签
    fn parse_reply(&self, reply: &str) -> Classification {
        let trimmed = reply.trim();
        let json = match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if end > start => Some(&trimmed[start..=end]),
            _ => None,
        };
        if let Some(parsed) = json.and_then(|j| serde_json::from_str::<LabelReply>(j).ok()) {
            let label = parsed.label.trim().to_lowercase();
            if self.labels.iter().any(|l| l.eq_ignore_ascii_case(&label)) {
                return Classification::new(label, parsed.confidence);
            }
        }
        let lower = trimmed.to_lowercase();
        self.labels
            .iter()
            .find(|l| lower.contains(&l.to_lowercase()))
            .map(|l| Classification::new(l.clone(), default_reply_confidence()))
            .unwrap_or_else(Classification::unknown)
    }
}

#[async_trait]
impl Classifier for ModelClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, String> {
        if let Some(fast) = &self.fast_path {
            if let Some(label) = fast.fast_match(text) {
                return Ok(Classification::new(label, KEYWORD_CONFIDENCE));
            }
        }
        let reply = generate_with_timeout(self.model.as_ref(), &self.prompt(text), &self.params)
            .await
            .map_err(|e| e.to_string())?;
        Ok(self.parse_reply(&reply))
    }
}
