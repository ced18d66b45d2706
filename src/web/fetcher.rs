//! HTTP 抓取：域名白名单、超时、结果大小限制
//!
//! GET 请求带超时与 User-Agent；HTML 响应经 html2text 提取可读文本；
//! 超过 max_result_chars 时截断并追加 ...[truncated]。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::WebSection;
use crate::web::WebFetcher;

const USER_AGENT: &str = concat!("hive/", env!("CARGO_PKG_VERSION"));

/// 基于 reqwest 的抓取器
pub struct HttpFetcher {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!") || s.to_ascii_lowercase().starts_with("<html") || (s.contains("</") && s.contains('<'))
}

/// 从 URL 中提取 host
fn extract_domain(url: &str) -> Option<String> {
    let rest = url
        .trim()
        .strip_prefix("https://")
        .or_else(|| url.trim().strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split(':').next()?;
    (!host.is_empty()).then(|| host.to_lowercase())
}

fn truncate_chars(body: String, max: usize) -> String {
    if body.chars().count() > max {
        body.chars().take(max).collect::<String>() + "\n...[truncated]"
    } else {
        body
    }
}

impl HttpFetcher {
    pub fn new(allowed_domains: Vec<String>, timeout: Duration, max_result_chars: usize) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: allowed_domains.into_iter().map(|d| d.to_lowercase()).collect(),
            max_result_chars,
        }
    }

    pub fn from_config(cfg: &WebSection) -> Self {
        Self::new(
            cfg.allowed_domains.clone(),
            Duration::from_secs(cfg.timeout_secs),
            cfg.max_result_chars,
        )
    }

    fn check_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| format!("Invalid or missing URL: {}", url))?;
        if self.allowed_domains.contains(&domain) {
            Ok(())
        } else {
            Err(format!("Domain not in allowlist: {}", domain))
        }
    }

    fn html_to_text(html: &str) -> String {
        match html2text::from_read(html.as_bytes(), 120) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => strip_html_tags(html),
        }
    }
}

#[async_trait]
impl WebFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, String> {
        self.check_allowed(url)?;
        tracing::info!(url = %url, "web fetch");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {}", e))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(body) {
            Self::html_to_text(body)
        } else {
            body.to_string()
        };
        Ok(truncate_chars(text, self.max_result_chars))
    }
}
