//! 错误恢复引擎
//!
//! 根据 AgentError 与工具幂等性返回 RecoveryAction：执行器据此决定是否就地重试，
//! AgentCore 据此决定重规划、终止目标还是按取消处理。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（重试 / 重规划 / 终止 / 停止）
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// idempotent 为 false 时永不自动重试，瞬时错误也直接上报给规划器
    pub fn handle(&self, err: &AgentError, idempotent: bool) -> RecoveryAction {
        match err {
            e if idempotent && e.is_transient() => RecoveryAction::Retry,
            AgentError::Cancelled => RecoveryAction::Stop,
            AgentError::PlanCycle(_) | AgentError::InvalidPlan(_) => {
                RecoveryAction::Abort(err.to_string())
            }
            AgentError::Config(msg) => RecoveryAction::Abort(format!("config: {msg}")),
            AgentError::SafetyDenied { .. }
            | AgentError::Timeout(_)
            | AgentError::ToolFailure { .. }
            | AgentError::UnknownTool(_) => RecoveryAction::Replan(err.to_string()),
            // 记忆与持久化问题不阻断执行，交由规划器判断
            AgentError::MemoryCapacity(_)
            | AgentError::Persistence(_)
            | AgentError::GoalNotFound(_) => RecoveryAction::Replan(err.to_string()),
        }
    }
}
