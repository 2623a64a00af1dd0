//! HTTP 抓取工具：域名白名单、超时、结果大小限制
//!
//! 仅允许配置中的域名；GET 请求带超时与 User-Agent；
//! 响应超过 max_result_chars 时截断并追加 ...[truncated]。
//! 对 HTML 响应使用 html2text 提取可读文本，去除标签与脚本。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::HttpSection;
use crate::core::ToolError;
use crate::tools::schema::schema_of;
use crate::tools::{Tool, ToolSpec};

/// http_fetch 参数
#[derive(Debug, Deserialize, JsonSchema)]
struct FetchArgs {
    /// 完整的 http(s) URL
    url: String,
}

pub struct HttpFetchTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
    timeout: Duration,
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.to_ascii_lowercase().starts_with("<html")
        || (s.contains("</") && (s.contains("<head") || s.contains("<body") || s.contains("<title")))
}

/// 从 URL 中提取 host（小写，不含端口）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

fn truncate(body: String, max_chars: usize) -> String {
    if body.chars().count() > max_chars {
        body.chars().take(max_chars).collect::<String>() + "\n...[truncated]"
    } else {
        body
    }
}

impl HttpFetchTool {
    pub fn new(allowed_domains: Vec<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8"),
        );
        let timeout = Duration::from_secs(timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("agnes/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: allowed_domains.into_iter().map(|d| d.to_lowercase()).collect(),
            max_result_chars,
            timeout,
        }
    }

    pub fn from_config(cfg: &HttpSection) -> Self {
        Self::new(cfg.allowed_domains.clone(), cfg.timeout_secs, cfg.max_result_chars)
    }

    fn check_allowed(&self, url: &str) -> Result<String, ToolError> {
        let domain = extract_domain(url)
            .ok_or_else(|| ToolError::InvalidInput(format!("invalid url '{url}'")))?;
        if self.allowed_domains.contains(&domain) {
            Ok(domain)
        } else {
            Err(ToolError::InvalidInput(format!("domain not in allowlist: {domain}")))
        }
    }

    async fn fetch(&self, url: &str) -> Result<Value, ToolError> {
        self.check_allowed(url)?;
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ToolError::Transient(format!("request failed: {e}"))
            } else {
                ToolError::Permanent(format!("request failed: {e}"))
            }
        })?;

        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ToolError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ToolError::Permanent(format!("HTTP {status}")));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| ToolError::Transient(format!("read body: {e}")))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(body) {
            match from_read(body.as_bytes(), 120) {
                Ok(text) if !text.trim().is_empty() => text,
                _ => strip_html_tags(body),
            }
        } else {
            body.to_string()
        };

        Ok(json!({
            "url": url,
            "status": status.as_u16(),
            "text": truncate(text, self.max_result_chars),
        }))
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "http_fetch",
            "Fetch URL content as readable text (domain allowlist). Args: {\"url\": \"https://...\"}",
        )
        .input_schema(schema_of::<FetchArgs>())
        .output_schema(json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "status": { "type": "integer" },
                "text": { "type": "string" }
            }
        }))
        .idempotent(true)
        .timeout(self.timeout + Duration::from_secs(1))
    }

    async fn execute(&self, params: Value) -> Result<Value, ToolError> {
        let args: FetchArgs = serde_json::from_value(params)
            .map_err(|e| ToolError::InvalidInput(format!("invalid arguments: {e}")))?;
        let url = args.url.trim();
        if url.is_empty() {
            return Err(ToolError::InvalidInput("missing url".to_string()));
        }
        tracing::info!(url = %url, "http_fetch");
        self.fetch(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://Docs.rs/tokio"), Some("docs.rs".into()));
        assert_eq!(extract_domain("http://example.com:8080/a"), Some("example.com".into()));
        assert_eq!(extract_domain("ftp://example.com"), None);
        assert_eq!(extract_domain("https://"), None);
    }

    #[test]
    fn test_html_detection_and_strip() {
        assert!(looks_like_html("<!DOCTYPE html><html></html>"));
        assert!(!looks_like_html("{\"a\": 1}"));
        assert_eq!(strip_html_tags("<p>Hello <b>world</b></p>"), "Hello world");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc".into(), 5), "abc");
        assert_eq!(truncate("abcdef".into(), 3), "abc\n...[truncated]");
    }

    #[tokio::test]
    async fn test_rejects_disallowed_domain_without_request() {
        let tool = HttpFetchTool::new(vec!["docs.rs".into()], 1, 100);
        let err = tool
            .execute(json!({"url": "https://evil.example/"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
        let missing = tool.execute(json!({})).await.unwrap_err();
        assert!(matches!(missing, ToolError::InvalidInput(_)));
    }

    #[test]
    fn test_input_schema_requires_url() {
        let spec = HttpFetchTool::new(vec![], 1, 100).spec();
        assert_eq!(spec.input_schema["required"], json!(["url"]));
        assert!(crate::tools::schema::validate(&spec.input_schema, &json!({"url": 1})).is_err());
    }
}
