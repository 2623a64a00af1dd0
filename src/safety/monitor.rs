//! 安全闸门：派发前按阶段依次评估规则
//!
//! 第一条 Deny 立即短路；Modify 的改写结果传给后续规则。每条被评估的规则的裁决都写入审计。

use std::sync::Arc;

use serde_json::Value;

use crate::config::SafetySection;
use crate::core::audit::{AuditKind, AuditLog};
use crate::core::AgentError;
use crate::safety::rules::{
    PolicyRule, ProposedAction, QuotaRule, SafetyContext, SafetyDecision, SafetyRule,
    SafetyVerdict, ShapeRule,
};

pub struct SafetyMonitor {
    rules: Vec<Arc<dyn SafetyRule>>,
    audit: Option<Arc<AuditLog>>,
}

impl SafetyMonitor {
    pub fn new(rules: Vec<Arc<dyn SafetyRule>>) -> Self {
        let mut monitor = Self {
            rules: Vec::new(),
            audit: None,
        };
        for rule in rules {
            monitor.push(rule);
        }
        monitor
    }

    /// 按 safety.checks 启用内置规则；未知检查名视为配置错误
    pub fn from_config(cfg: &SafetySection) -> Result<Self, AgentError> {
        let mut rules: Vec<Arc<dyn SafetyRule>> = Vec::new();
        for check in &cfg.checks {
            match check.as_str() {
                "policy" => rules.push(Arc::new(PolicyRule::new(
                    cfg.blocked_actions.clone(),
                    &cfg.blocked_terms,
                )?)),
                "quota" => {
                    if let Some(max) = cfg.max_calls_per_action {
                        rules.push(Arc::new(QuotaRule::new(max)));
                    }
                }
                "shape" => rules.push(Arc::new(ShapeRule::new(cfg.max_param_chars))),
                other => {
                    return Err(AgentError::Config(format!("unknown safety check '{other}'")))
                }
            }
        }
        Ok(Self::new(rules))
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 追加规则并保持阶段内的插入顺序
    pub fn push(&mut self, rule: Arc<dyn SafetyRule>) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| r.stage());
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name().to_string()).collect()
    }

    /// 评估一次派发；返回的裁决中 action 为最终（可能被改写的）动作
    pub fn evaluate(&self, action: ProposedAction, ctx: &SafetyContext<'_>) -> SafetyVerdict {
        let mut current = action;
        let mut modified: Vec<String> = Vec::new();

        for rule in &self.rules {
            let verdict = rule.evaluate(&current, ctx);
            self.emit(ctx, &verdict);
            match verdict.decision {
                SafetyDecision::Deny => {
                    tracing::warn!(
                        goal = %ctx.goal.id,
                        step = %ctx.step_id,
                        rule = %verdict.rule,
                        reason = %verdict.reason,
                        "action denied"
                    );
                    return verdict;
                }
                SafetyDecision::Modify => {
                    modified.push(format!("{}: {}", verdict.rule, verdict.reason));
                    current = verdict.action;
                }
                SafetyDecision::Allow => {}
            }
        }

        if modified.is_empty() {
            SafetyVerdict::allow("monitor", &current)
        } else {
            SafetyVerdict::modify("monitor", current, modified.join("; "))
        }
    }

    fn emit(&self, ctx: &SafetyContext<'_>, verdict: &SafetyVerdict) {
        if let Some(audit) = &self.audit {
            audit.record(
                AuditKind::SafetyVerdict,
                &ctx.goal.id,
                Some(ctx.step_id),
                serde_json::to_value(verdict).unwrap_or(Value::Null),
            );
        }
    }
}
