//! 工具层：注册表、执行器、内置工具与 Observation

pub mod echo;
pub mod executor;
pub mod function;
pub mod http_fetch;
pub mod observation;
pub mod registry;
pub mod schema;
pub mod summarize;

pub use echo::EchoTool;
pub use executor::{Executioner, Invocation, RetryPolicy, ToolCall};
pub use function::FnTool;
pub use http_fetch::HttpFetchTool;
pub use observation::Observation;
pub use registry::{Tool, ToolRegistry, ToolSpec};
pub use summarize::SummarizeTool;

use crate::config::ToolsSection;

/// 内置工具：echo、http_fetch、summarize
pub fn builtin_registry(cfg: &ToolsSection) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(HttpFetchTool::from_config(&cfg.http));
    registry.register(SummarizeTool);
    registry
}
