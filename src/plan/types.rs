//! 计划类型定义
//!
//! Plan 是一个目标的步骤 DAG：步骤存放在按 StepId 寻址的 arena 中，
//! 到达终态（Succeeded / Failed / Skipped）的步骤不再被修改。

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, ErrorKind, GoalId};

/// 步骤 ID：按目标单调分配，跨计划版本稳定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub u64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 等待依赖满足
    Pending,
    /// 依赖全部成功，可派发
    Ready,
    /// 已派发给执行器
    Running,
    Succeeded,
    Failed,
    /// 前置失败 / 跳过而未执行
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn is_started(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Ready)
    }
}

/// 规划策略产出的步骤声明：依赖按名称引用，由 PlanBuilder 解析为 StepId
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 越大越先派发
    #[serde(default)]
    pub priority: i32,
    /// 覆盖工具声明的超时
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// 失败时是否交给规划器重规划
    #[serde(default)]
    pub replan_on_failure: bool,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            params: Value::Object(Default::default()),
            depends_on: Vec::new(),
            priority: 0,
            timeout_secs: None,
            replan_on_failure: false,
        }
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn replan_on_failure(mut self) -> Self {
        self.replan_on_failure = true;
        self
    }
}

/// 计划图中的节点
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub action: String,
    /// 规划时的参数（安全改写不会回写这里）
    pub params: Value,
    /// 有序依赖集合
    pub depends_on: Vec<StepId>,
    pub priority: i32,
    pub status: StepStatus,
    pub timeout: Option<Duration>,
    pub replan_on_failure: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// 执行器尝试次数（含重试）
    pub attempts: u32,
}

/// 一个目标的某一版本计划
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub goal_id: GoalId,
    pub version: u32,
    steps: Vec<Step>,
    #[serde(skip)]
    index: HashMap<StepId, usize>,
    /// 下一个可分配的 StepId
    next_id: u64,
}

impl Plan {
    pub(crate) fn from_parts(goal_id: GoalId, version: u32, steps: Vec<Step>, next_id: u64) -> Self {
        let index = steps.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
        Self {
            goal_id,
            version,
            steps,
            index,
            next_id,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn get(&self, id: StepId) -> Option<&Step> {
        self.index.get(&id).map(|&i| &self.steps[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn get_mut(&mut self, id: StepId) -> Result<&mut Step, AgentError> {
        let i = *self
            .index
            .get(&id)
            .ok_or_else(|| AgentError::InvalidPlan(format!("unknown step {id}")))?;
        Ok(&mut self.steps[i])
    }

    /// 依赖是否全部成功
    pub fn dependencies_succeeded(&self, id: StepId) -> bool {
        self.get(id).is_some_and(|step| {
            step.depends_on
                .iter()
                .all(|d| self.get(*d).is_some_and(|p| p.status == StepStatus::Succeeded))
        })
    }

    /// 状态迁移；终态步骤拒绝修改，Running 要求依赖全部成功
    pub fn set_status(&mut self, id: StepId, status: StepStatus) -> Result<StepStatus, AgentError> {
        if status == StepStatus::Running && !self.dependencies_succeeded(id) {
            return Err(AgentError::InvalidPlan(format!(
                "step {id} cannot run before its dependencies succeed"
            )));
        }
        let step = self.get_mut(id)?;
        if step.status.is_terminal() {
            return Err(AgentError::InvalidPlan(format!(
                "step {id} is already {:?}",
                step.status
            )));
        }
        let previous = step.status;
        step.status = status;
        Ok(previous)
    }

    pub fn record_attempts(&mut self, id: StepId, attempts: u32) -> Result<(), AgentError> {
        self.get_mut(id)?.attempts = attempts;
        Ok(())
    }

    pub fn succeed(&mut self, id: StepId, output: Value) -> Result<(), AgentError> {
        self.set_status(id, StepStatus::Succeeded)?;
        self.get_mut(id)?.output = Some(output);
        Ok(())
    }

    pub fn fail(&mut self, id: StepId, error: &AgentError) -> Result<(), AgentError> {
        self.set_status(id, StepStatus::Failed)?;
        let step = self.get_mut(id)?;
        step.error = Some(error.to_string());
        step.error_kind = Some(error.kind());
        Ok(())
    }

    /// Pending 且依赖全部成功的步骤转为 Ready，返回新就绪的步骤
    pub fn promote_ready(&mut self) -> Vec<StepId> {
        let candidates: Vec<StepId> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.id)
            .filter(|id| self.dependencies_succeeded(*id))
            .collect();
        for id in &candidates {
            if let Ok(step) = self.get_mut(*id) {
                step.status = StepStatus::Ready;
            }
        }
        candidates
    }

    /// 前置步骤 Failed / Skipped 时，将未开始的后继传递性地标记为 Skipped
    pub fn propagate_skips(&mut self) -> Vec<StepId> {
        let mut skipped = Vec::new();
        loop {
            let next: Vec<StepId> = self
                .steps
                .iter()
                .filter(|s| !s.status.is_started())
                .filter(|s| {
                    s.depends_on.iter().any(|d| {
                        self.get(*d).is_some_and(|p| {
                            matches!(p.status, StepStatus::Failed | StepStatus::Skipped)
                        })
                    })
                })
                .map(|s| s.id)
                .collect();
            if next.is_empty() {
                return skipped;
            }
            for id in next {
                if let Ok(step) = self.get_mut(id) {
                    step.status = StepStatus::Skipped;
                }
                skipped.push(id);
            }
        }
    }

    /// 就绪步骤的派发顺序：优先级高者先，其次按插入顺序（StepId 单调分配）
    pub fn ready_steps(&self) -> Vec<StepId> {
        let mut ready: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Ready)
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        ready.into_iter().map(|s| s.id).collect()
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// 全部步骤 Succeeded 或 Skipped
    pub fn is_complete(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped))
    }

    /// 所有步骤均已到达终态
    pub fn is_settled(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn first_failure(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    /// 还原某一步骤的声明（依赖转回名称），供重规划复用
    pub fn spec_of(&self, step: &Step) -> StepSpec {
        StepSpec {
            name: step.name.clone(),
            action: step.action.clone(),
            params: step.params.clone(),
            depends_on: step
                .depends_on
                .iter()
                .filter_map(|d| self.get(*d).map(|p| p.name.clone()))
                .collect(),
            priority: step.priority,
            timeout_secs: step.timeout.map(|t| t.as_secs()),
            replan_on_failure: step.replan_on_failure,
        }
    }

    /// 传递性依赖于 name 的所有步骤名（不含自身）
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            let Some(current_id) = self.by_name(&current).map(|s| s.id) else {
                continue;
            };
            for step in &self.steps {
                if step.depends_on.contains(&current_id) && !found.contains(&step.name) {
                    found.push(step.name.clone());
                    frontier.push(step.name.clone());
                }
            }
        }
        found
    }
}
