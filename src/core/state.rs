//! 目标与状态定义：Goal、GoalState 状态机、GoalStatus 对外快照
//!
//! 外部只拿到 GoalStatus（状态 + 计划快照 + 终止原因 + 观察记录）；运行中的可变状态由 AgentCore 的目标任务独占。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::Plan;
use crate::tools::Observation;

pub type GoalId = String;

/// 用户提交的高层目标：文本 + 上下文映射，提交后只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub text: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl Goal {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: format!("goal_{}", uuid::Uuid::new_v4()),
            text: text.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<GoalId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// 修订目标：返回合并了新上下文的新 Goal（同一 id），原值不变
    pub fn amended(&self, updates: HashMap<String, Value>) -> Goal {
        let mut context = self.context.clone();
        context.extend(updates);
        Goal {
            id: self.id.clone(),
            text: self.text.clone(),
            context,
        }
    }
}

/// 目标状态机：Created → Planning → Executing ⇄ Replanning → Completed | Failed | Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalState {
    Created,
    Planning,
    Executing,
    Replanning,
    Completed,
    Failed,
    Cancelled,
}

impl GoalState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GoalState::Completed | GoalState::Failed | GoalState::Cancelled
        )
    }

    /// 状态机允许的迁移；任意非终态都可进入 Cancelled / Failed
    pub fn can_transition_to(self, next: GoalState) -> bool {
        use GoalState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled) | (_, Failed) => true,
            (Created, Planning) => true,
            (Planning, Executing) => true,
            (Executing, Replanning) | (Replanning, Executing) => true,
            (Executing, Completed) => true,
            _ => false,
        }
    }
}

/// getStatus 返回的快照
#[derive(Debug, Clone, Serialize)]
pub struct GoalStatus {
    pub goal_id: GoalId,
    pub state: GoalState,
    /// 当前生效的计划（不可变快照）；规划完成前为 None
    pub plan: Option<Arc<Plan>>,
    /// Failed / Cancelled 时的终止原因
    pub reason: Option<String>,
    pub observations: Vec<Observation>,
}

impl GoalStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_amendment_keeps_original() {
        let goal = Goal::new("fetch and summarize").with_context("url", Value::from("a"));
        let mut updates = HashMap::new();
        updates.insert("url".to_string(), Value::from("b"));
        let amended = goal.amended(updates);
        assert_eq!(amended.id, goal.id);
        assert_eq!(goal.context["url"], Value::from("a"));
        assert_eq!(amended.context["url"], Value::from("b"));
    }

    #[test]
    fn test_state_machine_transitions() {
        use GoalState::*;
        assert!(Created.can_transition_to(Planning));
        assert!(Planning.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Replanning));
        assert!(Replanning.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Replanning.can_transition_to(Cancelled));
        assert!(!Planning.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Failed.can_transition_to(Planning));
    }
}
