//! 安全规则：规则 trait 与内置规则（policy / quota / shape / 闭包）

use std::collections::HashMap;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::core::{AgentError, Goal};
use crate::plan::StepId;
use crate::tools::{schema, ToolSpec};

/// 规则阶段：按 Policy → Quota → Shape 稳定排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStage {
    /// 伦理 / 策略
    Policy,
    /// 资源配额
    Quota,
    /// 参数与输出形状
    Shape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyDecision {
    Allow,
    Deny,
    Modify,
}

/// 待派发的动作（工具名 + 已解析的参数）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposedAction {
    pub action: String,
    pub params: Value,
}

/// 单条规则（或整条链）的裁决；每次派发重新生成，不缓存
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyVerdict {
    pub decision: SafetyDecision,
    pub reason: String,
    /// 裁决后的动作；Modify 时为改写结果
    pub action: ProposedAction,
    pub rule: String,
}

impl SafetyVerdict {
    pub fn allow(rule: &str, action: &ProposedAction) -> Self {
        Self {
            decision: SafetyDecision::Allow,
            reason: String::new(),
            action: action.clone(),
            rule: rule.to_string(),
        }
    }

    pub fn deny(rule: &str, action: &ProposedAction, reason: impl Into<String>) -> Self {
        Self {
            decision: SafetyDecision::Deny,
            reason: reason.into(),
            action: action.clone(),
            rule: rule.to_string(),
        }
    }

    pub fn modify(rule: &str, action: ProposedAction, reason: impl Into<String>) -> Self {
        Self {
            decision: SafetyDecision::Modify,
            reason: reason.into(),
            action,
            rule: rule.to_string(),
        }
    }

    pub fn is_denied(&self) -> bool {
        self.decision == SafetyDecision::Deny
    }

    pub fn into_error(self) -> AgentError {
        AgentError::SafetyDenied {
            rule: self.rule,
            reason: self.reason,
        }
    }
}

/// 规则评估时可见的上下文
pub struct SafetyContext<'a> {
    pub goal: &'a Goal,
    pub step_id: StepId,
    /// 本目标内各动作已派发次数（不含本次）
    pub dispatched: &'a HashMap<String, u32>,
    pub tool: Option<&'a ToolSpec>,
}

pub trait SafetyRule: Send + Sync {
    fn name(&self) -> &str;

    fn stage(&self) -> RuleStage;

    fn evaluate(&self, action: &ProposedAction, ctx: &SafetyContext<'_>) -> SafetyVerdict;
}

/// 动作黑名单 + 参数敏感词（正则）
pub struct PolicyRule {
    blocked_actions: Vec<String>,
    blocked_terms: Vec<Regex>,
}

impl PolicyRule {
    pub fn new(blocked_actions: Vec<String>, blocked_terms: &[String]) -> Result<Self, AgentError> {
        let blocked_terms = blocked_terms
            .iter()
            .map(|t| {
                Regex::new(t).map_err(|e| AgentError::Config(format!("blocked term '{t}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            blocked_actions,
            blocked_terms,
        })
    }
}

impl SafetyRule for PolicyRule {
    fn name(&self) -> &str {
        "policy"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Policy
    }

    fn evaluate(&self, action: &ProposedAction, _ctx: &SafetyContext<'_>) -> SafetyVerdict {
        if self.blocked_actions.iter().any(|a| a == &action.action) {
            return SafetyVerdict::deny(
                self.name(),
                action,
                format!("action '{}' is blocked", action.action),
            );
        }
        let text = action.params.to_string();
        if let Some(term) = self.blocked_terms.iter().find(|re| re.is_match(&text)) {
            return SafetyVerdict::deny(
                self.name(),
                action,
                format!("params match blocked term '{}'", term.as_str()),
            );
        }
        SafetyVerdict::allow(self.name(), action)
    }
}

/// 单目标内同一动作的派发上限
pub struct QuotaRule {
    max_calls_per_action: u32,
}

impl QuotaRule {
    pub fn new(max_calls_per_action: u32) -> Self {
        Self {
            max_calls_per_action,
        }
    }
}

impl SafetyRule for QuotaRule {
    fn name(&self) -> &str {
        "quota"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Quota
    }

    fn evaluate(&self, action: &ProposedAction, ctx: &SafetyContext<'_>) -> SafetyVerdict {
        let used = ctx.dispatched.get(&action.action).copied().unwrap_or(0);
        if used >= self.max_calls_per_action {
            return SafetyVerdict::deny(
                self.name(),
                action,
                format!(
                    "action '{}' already dispatched {used} times (limit {})",
                    action.action, self.max_calls_per_action
                ),
            );
        }
        SafetyVerdict::allow(self.name(), action)
    }
}

/// 参数形状：过长字符串截断（Modify），不符合工具输入 schema 时拒绝
pub struct ShapeRule {
    max_param_chars: usize,
}

impl ShapeRule {
    pub fn new(max_param_chars: usize) -> Self {
        Self { max_param_chars }
    }

    fn truncate(&self, value: &mut Value) -> bool {
        match value {
            Value::String(s) if s.chars().count() > self.max_param_chars => {
                *s = s.chars().take(self.max_param_chars).collect();
                true
            }
            Value::Array(items) => items.iter_mut().fold(false, |acc, v| self.truncate(v) | acc),
            Value::Object(map) => map.values_mut().fold(false, |acc, v| self.truncate(v) | acc),
            _ => false,
        }
    }
}

impl SafetyRule for ShapeRule {
    fn name(&self) -> &str {
        "shape"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Shape
    }

    fn evaluate(&self, action: &ProposedAction, ctx: &SafetyContext<'_>) -> SafetyVerdict {
        if let Some(tool) = ctx.tool {
            if let Err(reason) = schema::validate(&tool.input_schema, &action.params) {
                return SafetyVerdict::deny(self.name(), action, format!("params rejected: {reason}"));
            }
        }
        let mut rewritten = action.clone();
        if self.truncate(&mut rewritten.params) {
            return SafetyVerdict::modify(
                self.name(),
                rewritten,
                format!("string params truncated to {} chars", self.max_param_chars),
            );
        }
        SafetyVerdict::allow(self.name(), action)
    }
}

type RuleFn = dyn Fn(&ProposedAction, &SafetyContext<'_>) -> SafetyVerdict + Send + Sync;

/// 闭包规则
pub struct FnRule {
    name: String,
    stage: RuleStage,
    check: Box<RuleFn>,
}

impl FnRule {
    pub fn new<F>(name: impl Into<String>, stage: RuleStage, check: F) -> Self
    where
        F: Fn(&ProposedAction, &SafetyContext<'_>) -> SafetyVerdict + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            stage,
            check: Box::new(check),
        }
    }
}

impl SafetyRule for FnRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> RuleStage {
        self.stage
    }

    fn evaluate(&self, action: &ProposedAction, ctx: &SafetyContext<'_>) -> SafetyVerdict {
        (self.check)(action, ctx)
    }
}
