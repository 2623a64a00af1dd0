//! 安全层：派发前的规则链（策略 / 配额 / 形状）

pub mod monitor;
pub mod rules;

pub use monitor::SafetyMonitor;
pub use rules::{
    FnRule, PolicyRule, ProposedAction, QuotaRule, RuleStage, SafetyContext, SafetyDecision,
    SafetyRule, SafetyVerdict, ShapeRule,
};
