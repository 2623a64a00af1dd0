//! Observation：单次工具调用尝试的记录，只追加不修改

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, ErrorKind, GoalId};
use crate::plan::StepId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub goal_id: GoalId,
    pub step_id: StepId,
    pub tool: String,
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
    pub success: bool,
    /// 成功时为工具输出，失败时为错误描述
    pub payload: Value,
    pub error: Option<ErrorKind>,
    pub latency_ms: u64,
    /// 本次之前已发生的重试次数
    pub retry_count: u32,
    /// 目标取消后才返回的结果
    #[serde(default)]
    pub late: bool,
    pub timestamp: i64,
}

impl Observation {
    pub(crate) fn from_result(
        goal_id: &str,
        step_id: StepId,
        tool: &str,
        attempt: u32,
        result: &Result<Value, AgentError>,
        latency_ms: u64,
    ) -> Self {
        let (success, payload, error) = match result {
            Ok(value) => (true, value.clone(), None),
            Err(e) => (false, Value::String(e.to_string()), Some(e.kind())),
        };
        Self {
            goal_id: goal_id.to_string(),
            step_id,
            tool: tool.to_string(),
            attempt,
            success,
            payload,
            error,
            latency_ms,
            retry_count: attempt.saturating_sub(1),
            late: false,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
