//! 计划构建器
//!
//! 提供流畅的 API 构建计划：按名称声明步骤与依赖，build 时分配 StepId、解析依赖并校验无环。

use std::collections::HashMap;
use std::time::Duration;

use crate::core::{AgentError, GoalId};
use crate::plan::graph::PlanGraph;
use crate::plan::types::{Plan, Step, StepId, StepSpec, StepStatus};

/// 计划构建器
pub struct PlanBuilder {
    goal_id: GoalId,
    version: u32,
    next_id: u64,
    /// 重规划时沿用的已成功步骤（保持原 id 与输出）
    carried: Vec<Step>,
    specs: Vec<StepSpec>,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new(goal_id: impl Into<GoalId>) -> Self {
        Self {
            goal_id: goal_id.into(),
            version: 1,
            next_id: 1,
            carried: Vec::new(),
            specs: Vec::new(),
        }
    }

    /// 设置计划版本号
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// 设置起始 StepId（重规划时接续上一版本）
    pub fn starting_id(mut self, next_id: u64) -> Self {
        self.next_id = self.next_id.max(next_id);
        self
    }

    /// 沿用上一版本的步骤
    pub fn carry(mut self, step: Step) -> Self {
        self.next_id = self.next_id.max(step.id.0 + 1);
        self.carried.push(step);
        self
    }

    /// 添加步骤
    pub fn step(mut self, spec: StepSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn steps(mut self, specs: impl IntoIterator<Item = StepSpec>) -> Self {
        self.specs.extend(specs);
        self
    }

    /// 设置顺序依赖：to 在 from 之后执行
    pub fn sequential(mut self, from: impl Into<String>, to: &str) -> Self {
        let from = from.into();
        if let Some(spec) = self.specs.iter_mut().find(|s| s.name == to) {
            if !spec.depends_on.contains(&from) {
                spec.depends_on.push(from);
            }
        }
        self
    }

    /// 构建计划：名称唯一、依赖存在、无环
    pub fn build(self) -> Result<Plan, AgentError> {
        let mut names: HashMap<String, StepId> = HashMap::new();
        for step in &self.carried {
            if names.insert(step.name.clone(), step.id).is_some() {
                return Err(AgentError::InvalidPlan(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }

        let mut next_id = self.next_id;
        for spec in &self.specs {
            if spec.name.is_empty() {
                return Err(AgentError::InvalidPlan("step name is empty".to_string()));
            }
            if names.insert(spec.name.clone(), StepId(next_id)).is_some() {
                return Err(AgentError::InvalidPlan(format!(
                    "duplicate step name '{}'",
                    spec.name
                )));
            }
            next_id += 1;
        }

        let mut steps = self.carried;
        for spec in self.specs {
            let id = names[&spec.name];
            let mut depends_on: Vec<StepId> = Vec::with_capacity(spec.depends_on.len());
            for dep in &spec.depends_on {
                let dep_id = *names.get(dep).ok_or_else(|| {
                    AgentError::InvalidPlan(format!(
                        "step '{}' depends on unknown step '{dep}'",
                        spec.name
                    ))
                })?;
                if !depends_on.contains(&dep_id) {
                    depends_on.push(dep_id);
                }
            }
            steps.push(Step {
                id,
                name: spec.name,
                action: spec.action,
                params: spec.params,
                depends_on,
                priority: spec.priority,
                status: StepStatus::Pending,
                timeout: spec.timeout_secs.map(Duration::from_secs),
                replan_on_failure: spec.replan_on_failure,
                output: None,
                error: None,
                error_kind: None,
                attempts: 0,
            });
        }
        steps.sort_by_key(|s| s.id);

        PlanGraph::validate(&steps)?;
        Ok(Plan::from_parts(self.goal_id, self.version, steps, next_id))
    }
}
