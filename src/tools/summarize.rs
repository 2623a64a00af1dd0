//! 摘要工具：抽取式，取前若干句

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::ToolError;
use crate::tools::{Tool, ToolSpec};

const DEFAULT_SENTENCES: usize = 3;

pub struct SummarizeTool;

/// 接受字符串、`{"text": ...}` 形状的抓取结果，或字符串数组（多个来源合并）
fn source_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("text").and_then(source_text),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(source_text).collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        _ => None,
    }
}

fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '。' | '！' | '？') {
            let s = current.split_whitespace().collect::<Vec<_>>().join(" ");
            if !s.is_empty() {
                out.push(s);
            }
            current.clear();
        }
    }
    let rest = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

#[async_trait]
impl Tool for SummarizeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "summarize",
            "Extractive summary of text. Args: {\"text\": \"...\", \"max_sentences\": 3}",
        )
        .input_schema(json!({
            "type": "object",
            "properties": { "max_sentences": { "type": "integer" } },
            "required": ["text"]
        }))
        .idempotent(true)
    }

    async fn execute(&self, params: Value) -> Result<Value, ToolError> {
        let text = params
            .get("text")
            .and_then(source_text)
            .ok_or_else(|| ToolError::InvalidInput("missing text".to_string()))?;
        let max = params
            .get("max_sentences")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_SENTENCES, |n| n as usize);

        let all = sentences(&text);
        let summary = all.iter().take(max).cloned().collect::<Vec<_>>().join(" ");
        Ok(json!({
            "summary": summary,
            "sentences": all.len().min(max),
            "source_chars": text.chars().count(),
        }))
    }
}
