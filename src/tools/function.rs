//! 闭包工具：用一个异步闭包实现 Tool，便于嵌入方与测试注册临时工具

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::{Tool, ToolSpec};

type BoxFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

pub struct FnTool {
    spec: ToolSpec,
    call: Arc<dyn Fn(Value) -> BoxFuture + Send + Sync>,
}

impl FnTool {
    pub fn new<F, Fut>(spec: ToolSpec, call: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            spec,
            call: Arc::new(move |params| Box::pin(call(params))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn execute(&self, params: Value) -> Result<Value, ToolError> {
        (self.call)(params).await
    }
}
