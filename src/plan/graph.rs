//! 计划依赖图
//!
//! 使用邻接表和入度表做 Kahn 拓扑排序；排序无法覆盖全部节点即存在环。
//! 参数里的 `$from` 引用必须指向传递前驱（或已成功的步骤），否则结果取决于调度顺序。

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::Value;

use crate::core::AgentError;
use crate::plan::types::{Step, StepId, StepStatus};

/// 计划依赖图
pub struct PlanGraph {
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 依赖数
    pub in_degree: HashMap<StepId, usize>,
}

impl PlanGraph {
    /// 创建依赖图；依赖不在 steps 中时返回 InvalidPlan
    pub fn new(steps: &[Step]) -> Result<Self, AgentError> {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for step in steps {
            in_degree.insert(step.id, 0);
            adjacency.insert(step.id, Vec::new());
        }

        for step in steps {
            for dep in &step.depends_on {
                let dependents = adjacency.get_mut(dep).ok_or_else(|| {
                    AgentError::InvalidPlan(format!(
                        "step '{}' depends on missing step {dep}",
                        step.name
                    ))
                })?;
                dependents.push(step.id);
                *in_degree.entry(step.id).or_insert(0) += 1;
            }
        }

        Ok(Self {
            adjacency,
            in_degree,
        })
    }

    /// 拓扑序（同层按 StepId 升序，结果确定）；有环时返回 PlanCycle，携带环上某个步骤名
    pub fn topological_order(&self, steps: &[Step]) -> Result<Vec<StepId>, AgentError> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: BTreeSet<StepId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            for dependent in self.adjacency.get(&id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() == in_degree.len() {
            return Ok(order);
        }

        let stuck = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .min()
            .and_then(|id| steps.iter().find(|s| s.id == id))
            .map(|s| s.name.clone())
            .unwrap_or_default();
        Err(AgentError::PlanCycle(stuck))
    }

    /// 校验 `$from` 引用：被引用的步骤须存在，且是引用方的传递前驱或已成功
    ///
    /// 须在确认无环之后调用。
    pub fn check_refs(&self, steps: &[Step]) -> Result<(), AgentError> {
        let by_id: HashMap<StepId, &Step> = steps.iter().map(|s| (s.id, s)).collect();
        let by_name: HashMap<&str, &Step> = steps.iter().map(|s| (s.name.as_str(), s)).collect();

        for step in steps.iter().filter(|s| !s.status.is_terminal()) {
            let mut refs = Vec::new();
            collect_refs(&step.params, &mut refs);
            if refs.is_empty() {
                continue;
            }
            let ancestors = ancestors_of(step, &by_id);
            for name in refs {
                let source = by_name.get(name.as_str()).ok_or_else(|| {
                    AgentError::InvalidPlan(format!(
                        "step '{}' reads '$from' unknown step '{name}'",
                        step.name
                    ))
                })?;
                if source.status != StepStatus::Succeeded && !ancestors.contains(&source.id) {
                    return Err(AgentError::InvalidPlan(format!(
                        "step '{}' reads '$from' step '{name}' without depending on it",
                        step.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// 校验计划：依赖存在、无环、`$from` 引用有依赖边支撑
    pub fn validate(steps: &[Step]) -> Result<(), AgentError> {
        let graph = Self::new(steps)?;
        graph.topological_order(steps)?;
        graph.check_refs(steps)
    }
}

/// 收集参数中的 `{"$from": "<step>", "pointer"?: ..}` 引用名（与派发时的解析规则一致）
pub(crate) fn collect_refs(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(source) = map.get("$from").and_then(Value::as_str) {
                if map.keys().all(|k| k == "$from" || k == "pointer") {
                    out.push(source.to_string());
                    return;
                }
            }
            map.values().for_each(|v| collect_refs(v, out));
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

fn ancestors_of(step: &Step, by_id: &HashMap<StepId, &Step>) -> HashSet<StepId> {
    let mut seen = HashSet::new();
    let mut stack: Vec<StepId> = step.depends_on.clone();
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            if let Some(dep) = by_id.get(&id) {
                stack.extend(dep.depends_on.iter().copied());
            }
        }
    }
    seen
}
