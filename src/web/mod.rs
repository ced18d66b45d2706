//! 网页抓取能力

pub mod fetcher;

pub use fetcher::HttpFetcher;

use async_trait::async_trait;

/// 抓取 URL，返回可读文本
#[async_trait]
pub trait WebFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, String>;
}

/// 从文本中提取第一个 http(s) URL
pub fn extract_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|w| w.starts_with("http://") || w.starts_with("https://"))
        .map(|w| {
            w.trim_end_matches(|c: char| matches!(c, ',' | '.' | ')' | '"' | '\'' | '>'))
                .to_string()
        })
}

/// 拼接搜索地址：查询词作为 `q` 参数
pub fn search_url(base: &str, query: &str) -> Result<String, String> {
    reqwest::Url::parse_with_params(base, &[("q", query)])
        .map(|u| u.to_string())
        .map_err(|e| format!("Invalid search url {}: {}", base, e))
}
