//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 Retry / Replan / Abort / Stop。
//! 工具边界使用独立的 ToolError（瞬时 / 永久 / 参数错误），由执行器统一转成 AgentError。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 运行时错误分类（规划、安全、工具、记忆、取消）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 计划图存在环，致命错误，目标直接失败
    #[error("Plan contains a dependency cycle through step '{0}'")]
    PlanCycle(String),

    /// 计划结构非法（依赖不存在、步骤名重复、动作未注册等）
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// 安全闸门拒绝（步骤级不可重试，触发重规划）
    #[error("Safety denied by rule '{rule}': {reason}")]
    SafetyDenied { rule: String, reason: String },

    #[error("Tool '{0}' timed out")]
    Timeout(String),

    /// 工具执行失败；transient=true 表示网络 / 资源类瞬时错误
    #[error("Tool '{tool}' failed: {message}")]
    ToolFailure {
        tool: String,
        message: String,
        transient: bool,
    },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 记忆层超容量；由淘汰策略在内部消化，不向调用方暴露
    #[error("Memory tier '{0}' over capacity")]
    MemoryCapacity(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Goal not found: {0}")]
    GoalNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl AgentError {
    /// 错误种类（写入 Observation / 审计事件）
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::PlanCycle(_) => ErrorKind::PlanCycle,
            AgentError::InvalidPlan(_) => ErrorKind::InvalidPlan,
            AgentError::SafetyDenied { .. } => ErrorKind::SafetyDenied,
            AgentError::Timeout(_) => ErrorKind::Timeout,
            AgentError::ToolFailure { transient: true, .. } => ErrorKind::TransientToolFailure,
            AgentError::ToolFailure { transient: false, .. } => ErrorKind::PermanentToolFailure,
            AgentError::UnknownTool(_) => ErrorKind::UnknownTool,
            AgentError::MemoryCapacity(_) => ErrorKind::MemoryCapacity,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::GoalNotFound(_) => ErrorKind::GoalNotFound,
            AgentError::Config(_) => ErrorKind::Config,
            AgentError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// 是否属于可由执行器就地重试的瞬时错误（仅对幂等工具生效）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Timeout(_) | AgentError::ToolFailure { transient: true, .. }
        )
    }
}

/// 可序列化的错误种类标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PlanCycle,
    InvalidPlan,
    SafetyDenied,
    Timeout,
    TransientToolFailure,
    PermanentToolFailure,
    UnknownTool,
    MemoryCapacity,
    Cancelled,
    GoalNotFound,
    Config,
    Persistence,
}

/// 工具边界错误：工具实现只需区分瞬时 / 永久 / 参数错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// 网络抖动、限流、资源暂时不足等，可重试
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ToolError {
    pub fn into_agent_error(self, tool: &str) -> AgentError {
        let (message, transient) = match self {
            ToolError::Transient(m) => (m, true),
            ToolError::Permanent(m) => (m, false),
            ToolError::InvalidInput(m) => (format!("invalid input: {m}"), false),
        };
        AgentError::ToolFailure {
            tool: tool.to_string(),
            message,
            transient,
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 执行器就地重试（幂等工具 + 瞬时错误）
    Retry,
    /// 交给 TaskPlanner 重规划（绕行 / 替换 / 放弃由规划策略决定）
    Replan(String),
    /// 致命错误，目标直接失败
    Abort(String),
    /// 取消：目标进入 Cancelled，不视为错误
    Stop,
}
