//! 工具注册表
//!
//! 所有工具实现 Tool trait（spec / execute），由 ToolRegistry 按名注册与查找。
//! 注册表在启动时构建，之后以 `Arc<ToolRegistry>` 只读共享；热更新通过 reregister 生成新注册表。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::ToolError;

/// 工具声明
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    /// 幂等工具才会在瞬时错误后自动重试
    pub idempotent: bool,
    /// 未设置时使用 executor.default_timeout_secs
    pub timeout: Option<Duration>,
    /// 可取消的调用在超时或目标取消时直接中止
    pub cancellable: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: Value::Null,
            idempotent: false,
            timeout: None,
            cancellable: true,
        }
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }
}

/// 工具 trait：声明 + 异步执行（参数与结果均为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn execute(&self, params: Value) -> Result<Value, ToolError>;
}

#[derive(Clone)]
struct Registered {
    spec: Arc<ToolSpec>,
    tool: Arc<dyn Tool>,
}

/// 工具注册表：按名称存储工具及其声明
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Registered>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let spec = tool.spec();
        tracing::debug!(tool = %spec.name, idempotent = spec.idempotent, "tool registered");
        self.tools.insert(
            spec.name.clone(),
            Registered {
                spec: Arc::new(spec),
                tool,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| Arc::clone(&r.tool))
    }

    pub fn spec(&self, name: &str) -> Option<Arc<ToolSpec>> {
        self.tools.get(name).map(|r| Arc::clone(&r.spec))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 热更新：返回包含新工具的新注册表，原注册表不变
    pub fn reregister(&self, tool: impl Tool + 'static) -> ToolRegistry {
        let mut next = self.clone();
        next.register(tool);
        next
    }

    /// 全部工具声明的 JSON 数组
    pub fn to_schema_json(&self) -> String {
        let specs: Vec<&ToolSpec> = self.tools.values().map(|r| r.spec.as_ref()).collect();
        serde_json::to_string_pretty(&specs).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;
    use serde_json::json;

    struct Versioned(u32);

    #[async_trait]
    impl Tool for Versioned {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("versioned", "returns its version").idempotent(true)
        }

        async fn execute(&self, _params: Value) -> Result<Value, ToolError> {
            Ok(json!(self.0))
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        let spec = registry.spec("echo").unwrap();
        assert!(spec.idempotent);

        let out = registry
            .get("echo")
            .unwrap()
            .execute(json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, json!("hi"));
    }

    #[tokio::test]
    async fn test_reregister_leaves_original_untouched() {
        let mut registry = ToolRegistry::new();
        registry.register(Versioned(1));
        let updated = registry.reregister(Versioned(2));

        let old = registry.get("versioned").unwrap().execute(json!({})).await.unwrap();
        let new = updated.get("versioned").unwrap().execute(json!({})).await.unwrap();
        assert_eq!(old, json!(1));
        assert_eq!(new, json!(2));
    }

    #[test]
    fn test_schema_json_lists_all_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(Versioned(1));
        let parsed: Value = serde_json::from_str(&registry.to_schema_json()).unwrap();
        let names: Vec<&str> = parsed
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["echo", "versioned"]);
    }
}
