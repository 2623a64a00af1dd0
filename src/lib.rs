//! Agnes - 目标驱动的自主任务编排运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 目标生命周期、主控循环、错误与恢复、审计、调度与取消
//! - **memory**: Working / Episodic / LongTerm 三层记忆与持久化
//! - **observability**: tracing 初始化
//! - **plan**: 计划（依赖图）、分解策略与重规划
//! - **safety**: 派发前的安全规则链
//! - **tools**: 工具注册表、执行器（超时 / 重试 / 取消）与内置工具

pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod safety;
pub mod tools;

pub use crate::config::{load_config, AppConfig};
pub use crate::core::{AgentBuilder, AgentCore, AgentError, Goal, GoalId, GoalState, GoalStatus};
