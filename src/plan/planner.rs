//! TaskPlanner：目标分解与重规划
//!
//! 分解逻辑由可插拔的 PlanStrategy 提供；TaskPlanner 负责把策略产出的步骤声明构建成合法计划
//! （依赖存在、无环），并在重规划时决定哪些已成功步骤可以沿用。

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::{AgentError, Goal};
use crate::memory::MemoryView;
use crate::plan::builder::PlanBuilder;
use crate::plan::types::{Plan, Step, StepId, StepSpec, StepStatus};
use crate::tools::Observation;

/// 触发重规划的原因
#[derive(Debug, Clone, PartialEq)]
pub enum ReplanTrigger {
    /// 步骤失败（标记了 replan_on_failure，或被安全闸门拒绝）
    StepFailed { step: StepId, error: AgentError },
    /// 某个 Observation 使下游步骤的前提失效
    Invalidated { step: StepId, names: Vec<String> },
    /// 目标被显式修订
    GoalAmended,
}

impl ReplanTrigger {
    pub fn describe(&self, plan: &Plan) -> String {
        let name = |id: &StepId| {
            plan.get(*id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| id.to_string())
        };
        match self {
            ReplanTrigger::StepFailed { step, error } => {
                format!("step '{}' failed: {error}", name(step))
            }
            ReplanTrigger::Invalidated { step, names } => {
                format!("step '{}' invalidated {names:?}", name(step))
            }
            ReplanTrigger::GoalAmended => "goal amended".to_string(),
        }
    }
}

/// 重规划时策略能看到的全部上下文
pub struct ReplanRequest<'a> {
    pub goal: &'a Goal,
    /// 当前生效的计划
    pub plan: &'a Plan,
    /// 之前被替换掉的版本（不含当前）
    pub history: &'a [Arc<Plan>],
    pub observations: &'a [Observation],
    pub memory: &'a MemoryView,
    pub trigger: &'a ReplanTrigger,
}

impl ReplanRequest<'_> {
    /// 某个步骤名在所有版本中失败的次数
    pub fn failures_of(&self, name: &str) -> usize {
        self.history
            .iter()
            .map(|p| p.as_ref())
            .chain(std::iter::once(self.plan))
            .flat_map(|p| p.steps())
            .filter(|s| s.name == name && s.status == StepStatus::Failed)
            .count()
    }
}

/// 策略给出的修订结果
#[derive(Debug, Clone, PartialEq)]
pub enum Revision {
    /// 放弃目标
    Abort(String),
    /// 期望的完整步骤列表；invalidate 中的已成功步骤不再沿用
    Steps {
        steps: Vec<StepSpec>,
        invalidate: Vec<String>,
    },
}

/// 规划结果
#[derive(Debug, Clone)]
pub enum Replan {
    Replaced(Plan),
    Abort(String),
}

/// 可插拔的分解策略
pub trait PlanStrategy: Send + Sync {
    /// 将目标分解为步骤声明
    fn decompose(&self, goal: &Goal, memory: &MemoryView) -> Result<Vec<StepSpec>, AgentError>;

    /// 重规划；默认：目标修订时重新分解，下游失效时重跑失效步骤，其余放弃
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
            ReplanTrigger::StepFailed { .. } => {
                Ok(Revision::Abort(request.trigger.describe(request.plan)))
            }
        }
    }

    /// 检查一条成功的 Observation 是否使某些步骤失效，返回需要重跑的步骤名
    fn invalidated_by(&self, _observation: &Observation, _plan: &Plan) -> Vec<String> {
        Vec::new()
    }
}

/// 计划中除 Failed / Skipped 以外所有步骤的声明
pub fn live_specs(plan: &Plan) -> Vec<StepSpec> {
    plan.steps()
        .iter()
        .filter(|s| !matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
        .map(|s| plan.spec_of(s))
        .collect()
}

pub struct TaskPlanner {
    strategy: Arc<dyn PlanStrategy>,
}

impl TaskPlanner {
    pub fn new(strategy: Arc<dyn PlanStrategy>) -> Self {
        Self { strategy }
    }

    /// 初次规划；环或非法依赖在任何步骤执行前即失败
    pub fn plan(&self, goal: &Goal, memory: &MemoryView) -> Result<Plan, AgentError> {
        let specs = self.strategy.decompose(goal, memory)?;
        if specs.is_empty() {
            return Err(AgentError::InvalidPlan(format!(
                "no steps for goal '{}'",
                goal.text
            )));
        }
        let plan = PlanBuilder::new(goal.id.clone()).steps(specs).build()?;
        tracing::info!(goal = %goal.id, steps = plan.len(), "plan created");
        Ok(plan)
    }

    pub fn invalidated_by(&self, observation: &Observation, plan: &Plan) -> Vec<String> {
        self.strategy.invalidated_by(observation, plan)
    }

    /// 生成新版本计划
    ///
    /// 已成功步骤原样沿用（id、输出不变），除非：被策略点名失效、被同名但不同内容的声明重新定义、
    /// 或其依赖未被沿用。未开始的步骤全部丢弃，由修订中的声明替换；重新定义的步骤分配新 id。
    pub fn replan(&self, request: &ReplanRequest<'_>) -> Result<Replan, AgentError> {
        let (mut specs, invalidate) = match self.strategy.revise(request)? {
            Revision::Abort(reason) => return Ok(Replan::Abort(reason)),
            Revision::Steps { steps, invalidate } => (steps, invalidate),
        };
        let plan = request.plan;
        let invalid: HashSet<&str> = invalidate.iter().map(String::as_str).collect();

        let mut carried: Vec<&Step> = plan
            .steps()
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded && !invalid.contains(s.name.as_str()))
            .filter(|s| {
                specs
                    .iter()
                    .find(|spec| spec.name == s.name)
                    .map_or(true, |spec| *spec == plan.spec_of(s))
            })
            .collect();

        // 依赖未被沿用的步骤输入已失效，传递性剔除
        loop {
            let ids: HashSet<StepId> = carried.iter().map(|s| s.id).collect();
            let before = carried.len();
            carried.retain(|s| s.depends_on.iter().all(|d| ids.contains(d)));
            if carried.len() == before {
                break;
            }
        }

        let carried_names: HashSet<&str> = carried.iter().map(|s| s.name.as_str()).collect();
        specs.retain(|spec| !carried_names.contains(spec.name.as_str()));

        let next = PlanBuilder::new(plan.goal_id.clone())
            .version(plan.version + 1)
            .starting_id(plan.next_id());
        let next = carried
            .into_iter()
            .fold(next, |builder, step| builder.carry(step.clone()))
            .steps(specs)
            .build()?;

        tracing::info!(
            goal = %plan.goal_id,
            version = next.version,
            steps = next.len(),
            reason = %request.trigger.describe(plan),
            "plan revised"
        );
        Ok(Replan::Replaced(next))
    }
}
