//! 基于配置模板的分解策略
//!
//! 模板在 `[[planner.templates]]` 中声明：按 `context["template"]` 指定，否则按关键词命中数选择。
//! 参数中的 `{"$goal": key}` 取目标上下文（`text` 取目标原文），`{"$memory": key}` 取记忆视图中的值。

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::PlannerSection;
use crate::core::{AgentError, ErrorKind, Goal};
use crate::memory::MemoryView;
use crate::plan::planner::{live_specs, PlanStrategy, ReplanRequest, ReplanTrigger, Revision};
use crate::plan::types::{Plan, StepSpec, StepStatus};
use crate::tools::Observation;

/// 计划模板
#[derive(Debug, Clone, Deserialize)]
pub struct PlanTemplate {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub steps: Vec<StepSpec>,
}

/// 步骤失败后的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// 目标失败
    #[default]
    Abort,
    /// 以新步骤重新执行失败步骤
    Retry,
    /// 丢弃失败步骤及其下游，其余继续
    Skip,
}

pub struct TemplateStrategy {
    templates: Vec<PlanTemplate>,
    on_failure: FailurePolicy,
    max_step_retries: u32,
}

impl TemplateStrategy {
    pub fn new(templates: Vec<PlanTemplate>, on_failure: FailurePolicy, max_step_retries: u32) -> Self {
        Self {
            templates,
            on_failure,
            max_step_retries,
        }
    }

    pub fn from_config(cfg: &PlannerSection) -> Self {
        Self::new(cfg.templates.clone(), cfg.on_failure, cfg.max_step_retries)
    }

    fn select(&self, goal: &Goal) -> Result<&PlanTemplate, AgentError> {
        if let Some(name) = goal.context.get("template").and_then(Value::as_str) {
            return self
                .templates
                .iter()
                .find(|t| t.name == name)
                .ok_or_else(|| AgentError::InvalidPlan(format!("unknown template '{name}'")));
        }

        let text = goal.text.to_lowercase();
        let mut best: Option<(&PlanTemplate, usize)> = None;
        for template in &self.templates {
            let hits = template
                .keywords
                .iter()
                .filter(|k| text.contains(&k.to_lowercase()))
                .count();
            if hits > 0 && best.map_or(true, |(_, most)| hits > most) {
                best = Some((template, hits));
            }
        }
        best.map(|(t, _)| t).ok_or_else(|| {
            AgentError::InvalidPlan(format!("no template matches goal '{}'", goal.text))
        })
    }

    fn failed_revision(&self, plan: &Plan, request: &ReplanRequest<'_>) -> Revision {
        let failed: Vec<_> = plan
            .steps()
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .collect();

        match self.on_failure {
            FailurePolicy::Abort => Revision::Abort(request.trigger.describe(plan)),
            FailurePolicy::Retry => {
                for step in &failed {
                    if step.error_kind == Some(ErrorKind::SafetyDenied) {
                        return Revision::Abort(format!(
                            "step '{}' denied by safety policy",
                            step.name
                        ));
                    }
                    let failures = request.failures_of(&step.name);
                    if failures > self.max_step_retries as usize {
                        return Revision::Abort(format!(
                            "step '{}' failed {failures} times",
                            step.name
                        ));
                    }
                }
                Revision::Steps {
                    steps: plan.steps().iter().map(|s| plan.spec_of(s)).collect(),
                    invalidate: Vec::new(),
                }
            }
            FailurePolicy::Skip => {
                let mut dropped: Vec<String> = Vec::new();
                for step in &failed {
                    dropped.push(step.name.clone());
                    dropped.extend(plan.dependents_of(&step.name));
                }
                let steps: Vec<StepSpec> = live_specs(plan)
                    .into_iter()
                    .filter(|s| !dropped.contains(&s.name))
                    .collect();
                if steps.is_empty() {
                    return Revision::Abort(request.trigger.describe(plan));
                }
                Revision::Steps {
                    steps,
                    invalidate: Vec::new(),
                }
            }
        }
    }
}

impl PlanStrategy for TemplateStrategy {
    fn decompose(&self, goal: &Goal, memory: &MemoryView) -> Result<Vec<StepSpec>, AgentError> {
        let template = self.select(goal)?;
        tracing::debug!(goal = %goal.id, template = %template.name, "template selected");
        let replan_on_failure = self.on_failure != FailurePolicy::Abort;
        template
            .steps
            .iter()
            .map(|spec| {
                let mut spec = spec.clone();
                spec.params = expand(&spec.params, goal, memory)?;
                spec.replan_on_failure |= replan_on_failure;
                Ok(spec)
            })
            .collect()
    }

    fn revise(&self, request: &ReplanRequest<'_>) -> Result<Revision, AgentError> {
        match request.trigger {
            ReplanTrigger::GoalAmended => Ok(Revision::Steps {
                steps: self.decompose(request.goal, request.memory)?,
                invalidate: Vec::new(),
            }),
            ReplanTrigger::Invalidated { names, .. } => Ok(Revision::Steps {
                steps: live_specs(request.plan),
                invalidate: names.clone(),
            }),
            ReplanTrigger::StepFailed { .. } => Ok(self.failed_revision(request.plan, request)),
        }
    }

    /// 工具输出 `{"invalidates": [步骤名...]}` 时，点名的已成功步骤需要重跑
    fn invalidated_by(&self, observation: &Observation, plan: &Plan) -> Vec<String> {
        let Some(names) = observation.payload.get("invalidates").and_then(Value::as_array) else {
            return Vec::new();
        };
        names
            .iter()
            .filter_map(Value::as_str)
            .filter(|name| {
                plan.by_name(name)
                    .is_some_and(|s| s.status == StepStatus::Succeeded)
            })
            .map(str::to_string)
            .collect()
    }
}

/// 展开 `$goal` / `$memory` 占位符；`$from` 留到派发时解析
fn expand(value: &Value, goal: &Goal, memory: &MemoryView) -> Result<Value, AgentError> {
    match value {
        Value::Object(map) => {
            if let Some(key) = placeholder(map, "$goal") {
                return match goal.context.get(key) {
                    Some(v) => Ok(v.clone()),
                    None if key == "text" => Ok(Value::String(goal.text.clone())),
                    None => Err(AgentError::InvalidPlan(format!(
                        "goal has no context value '{key}'"
                    ))),
                };
            }
            if let Some(key) = placeholder(map, "$memory") {
                return Ok(memory.lookup(key).cloned().unwrap_or(Value::Null));
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), expand(v, goal, memory)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| expand(v, goal, memory))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn placeholder<'a>(map: &'a Map<String, Value>, marker: &str) -> Option<&'a str> {
    if map.len() != 1 {
        return None;
    }
    map.get(marker).and_then(Value::as_str)
}
