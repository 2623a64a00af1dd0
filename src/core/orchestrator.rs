//! 目标编排：单个目标的主控循环
//!
//! 每个目标一个后台任务，独占其可变计划：规划 → 按依赖与优先级派发 Ready 步骤（安全闸门 → 执行器）→
//! 处理 Observation 与记忆写入 → 需要时排空在途步骤再重规划，直到进入终态。
//! 外部通过 watch 通道读取 GoalStatus 快照，通过 mpsc 通道发送修订命令。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::audit::{AuditKind, AuditLog};
use crate::core::task_scheduler::TaskScheduler;
use crate::core::{AgentError, Goal, GoalState, GoalStatus, RecoveryAction, RecoveryEngine};
use crate::memory::{MemoryEntry, MemoryManager, MemoryTier};
use crate::plan::{Plan, Replan, ReplanRequest, ReplanTrigger, StepId, StepStatus, TaskPlanner};
use crate::safety::{ProposedAction, SafetyContext, SafetyDecision, SafetyMonitor};
use crate::tools::{Executioner, Invocation, Observation, ToolCall};

/// 所有目标共享的组件
pub(crate) struct Runtime {
    pub planner: TaskPlanner,
    pub safety: SafetyMonitor,
    pub executor: Arc<Executioner>,
    pub memory: Arc<MemoryManager>,
    pub audit: Arc<AuditLog>,
    pub scheduler: TaskScheduler,
    pub recovery: RecoveryEngine,
    pub max_replans: u32,
    pub memory_budget: usize,
}

/// 发往运行中目标的命令
#[derive(Debug, Clone)]
pub(crate) enum GoalCommand {
    /// 合并新的上下文并重规划
    Amend(HashMap<String, Value>),
}

struct StepFinished {
    step_id: StepId,
    invocation: Invocation,
}

struct Outcome {
    state: GoalState,
    reason: Option<String>,
}

impl Outcome {
    fn completed() -> Self {
        Self {
            state: GoalState::Completed,
            reason: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: GoalState::Failed,
            reason: Some(reason.into()),
        }
    }

    fn cancelled() -> Self {
        Self {
            state: GoalState::Cancelled,
            reason: Some("cancelled".to_string()),
        }
    }
}

pub(crate) struct GoalRun {
    rt: Arc<Runtime>,
    goal: Goal,
    state: GoalState,
    /// 规划完成前为空计划（version 0）
    plan: Plan,
    history: Vec<Arc<Plan>>,
    observations: Vec<Observation>,
    /// 本目标内各动作已派发次数（配额规则使用）
    dispatched: HashMap<String, u32>,
    replans: u32,
    status_tx: watch::Sender<GoalStatus>,
    commands: mpsc::UnboundedReceiver<GoalCommand>,
    cancel: CancellationToken,
}

impl GoalRun {
    pub(crate) fn new(
        rt: Arc<Runtime>,
        goal: Goal,
        status_tx: watch::Sender<GoalStatus>,
        commands: mpsc::UnboundedReceiver<GoalCommand>,
        cancel: CancellationToken,
    ) -> Self {
        let plan = Plan::from_parts(goal.id.clone(), 0, Vec::new(), 1);
        Self {
            rt,
            goal,
            state: GoalState::Created,
            plan,
            history: Vec::new(),
            observations: Vec::new(),
            dispatched: HashMap::new(),
            replans: 0,
            status_tx,
            commands,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) -> GoalState {
        let outcome = self.drive().await;
        self.finish(outcome)
    }

    async fn drive(&mut self) -> Outcome {
        self.transition(GoalState::Planning, None);
        if self.cancel.is_cancelled() {
            return Outcome::cancelled();
        }

        let view = self.rt.memory.view(&self.goal.id, self.rt.memory_budget);
        match self.rt.planner.plan(&self.goal, &view) {
            Ok(plan) => {
                self.install(plan);
            }
            Err(e) => {
                tracing::warn!(goal = %self.goal.id, error = %e, "planning failed");
                return Outcome::failed(e.to_string());
            }
        }
        self.transition(GoalState::Executing, None);
        self.execute().await
    }

    async fn execute(&mut self) -> Outcome {
        let mut tasks: JoinSet<StepFinished> = JoinSet::new();
        let mut trigger: Option<ReplanTrigger> = None;
        let mut fatal: Option<String> = None;
        let mut cancelling = false;

        loop {
            if trigger.is_none() && fatal.is_none() && !self.cancel.is_cancelled() {
                self.dispatch_ready(&mut tasks, &mut trigger).await;
                self.publish();
            }

            if tasks.is_empty() {
                if self.cancel.is_cancelled() {
                    return Outcome::cancelled();
                }
                if let Some(reason) = fatal.take() {
                    self.settle_skips();
                    return Outcome::failed(reason);
                }
                // 最后一个步骤与修订命令同时就绪时，select! 可能先处理步骤
                while let Ok(cmd) = self.commands.try_recv() {
                    self.on_command(cmd, &mut trigger);
                }
                if let Some(t) = trigger.take() {
                    match self.replan(t) {
                        Ok(()) => continue,
                        Err(outcome) => return outcome,
                    }
                }
                let plan = &self.plan;
                if plan.is_complete() {
                    return Outcome::completed();
                }
                if let Some(step) = plan.first_failure() {
                    return Outcome::failed(format!(
                        "step '{}' failed: {}",
                        step.name,
                        step.error.as_deref().unwrap_or("unknown error")
                    ));
                }
                if plan.ready_steps().is_empty() {
                    return Outcome::failed("plan stalled with no runnable steps");
                }
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if !cancelling => {
                    cancelling = true;
                    tracing::info!(goal = %self.goal.id, in_flight = tasks.len(), "cancelling goal, draining in-flight steps");
                }
                Some(cmd) = self.commands.recv(), if !cancelling => {
                    self.on_command(cmd, &mut trigger);
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(finished)) => {
                        self.on_step_finished(finished, &mut trigger, &mut fatal);
                        self.publish();
                    }
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return Outcome::failed(format!("step task aborted: {e}"));
                    }
                    None => {}
                },
            }
        }
    }

    /// 在单目标与全局并发许可内派发 Ready 步骤（优先级降序，其次 StepId 升序）
    async fn dispatch_ready(
        &mut self,
        tasks: &mut JoinSet<StepFinished>,
        trigger: &mut Option<ReplanTrigger>,
    ) {
        let promoted = self.plan.promote_ready();
        for id in promoted {
            self.step_event(id, StepStatus::Ready, json!({}));
        }

        let slots = self.rt.scheduler.free_slots(tasks.len());
        let ready: Vec<StepId> = self.plan.ready_steps().into_iter().take(slots).collect();
        for id in ready {
            if trigger.is_some() || self.cancel.is_cancelled() {
                break;
            }
            self.dispatch(id, tasks, trigger).await;
        }
    }

    async fn dispatch(
        &mut self,
        id: StepId,
        tasks: &mut JoinSet<StepFinished>,
        trigger: &mut Option<ReplanTrigger>,
    ) {
        let Some(step) = self.plan.get(id).cloned() else {
            return;
        };

        let params = match resolve_refs(&step.params, &self.plan) {
            Ok(params) => params,
            Err(e) => {
                self.fail_step(id, &e, trigger);
                return;
            }
        };

        let verdict = {
            let tool = self.rt.executor.registry().spec(&step.action);
            let ctx = SafetyContext {
                goal: &self.goal,
                step_id: id,
                dispatched: &self.dispatched,
                tool: tool.as_deref(),
            };
            self.rt.safety.evaluate(
                ProposedAction {
                    action: step.action.clone(),
                    params: params.clone(),
                },
                &ctx,
            )
        };

        let decision = verdict.decision;
        let action = match decision {
            SafetyDecision::Deny => {
                self.fail_step(id, &verdict.into_error(), trigger);
                return;
            }
            SafetyDecision::Modify => {
                self.rt.audit.record(
                    AuditKind::ActionModified,
                    &self.goal.id,
                    Some(id),
                    json!({
                        "reason": verdict.reason,
                        "original": { "action": step.action, "params": params },
                        "rewritten": verdict.action,
                    }),
                );
                verdict.action
            }
            SafetyDecision::Allow => verdict.action,
        };

        let permit = match self.rt.scheduler.acquire(&self.cancel).await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if let Err(e) = self.plan.set_status(id, StepStatus::Running) {
            tracing::error!(goal = %self.goal.id, step = %id, error = %e, "cannot start step");
            return;
        }
        self.step_event(id, StepStatus::Running, json!({ "action": action.action }));
        *self.dispatched.entry(action.action.clone()).or_insert(0) += 1;

        let executor = Arc::clone(&self.rt.executor);
        let token = self.cancel.child_token();
        let goal_id = self.goal.id.clone();
        let timeout = step.timeout;
        tasks.spawn(async move {
            let _permit = permit;
            let invocation = executor
                .invoke(
                    ToolCall {
                        goal_id: &goal_id,
                        step_id: id,
                        action: &action.action,
                        params: action.params,
                        timeout,
                    },
                    &token,
                )
                .await;
            StepFinished {
                step_id: id,
                invocation,
            }
        });
    }

    fn on_command(&mut self, cmd: GoalCommand, trigger: &mut Option<ReplanTrigger>) {
        match cmd {
            GoalCommand::Amend(updates) => {
                tracing::info!(goal = %self.goal.id, keys = ?updates.keys().collect::<Vec<_>>(), "goal amended");
                self.goal = self.goal.amended(updates);
                trigger.get_or_insert(ReplanTrigger::GoalAmended);
            }
        }
    }

    fn on_step_finished(
        &mut self,
        finished: StepFinished,
        trigger: &mut Option<ReplanTrigger>,
        fatal: &mut Option<String>,
    ) {
        let StepFinished {
            step_id,
            invocation,
        } = finished;
        let attempts = invocation.attempts();
        let last = invocation.observations.last().cloned();
        self.observations.extend(invocation.observations);
        if let Err(e) = self.plan.record_attempts(step_id, attempts) {
            tracing::error!(goal = %self.goal.id, step = %step_id, error = %e, "unknown step finished");
            return;
        }
        let cancelled = self.cancel.is_cancelled();

        match invocation.outcome {
            Ok(output) => {
                if let Err(e) = self.plan.succeed(step_id, output.clone()) {
                    tracing::error!(goal = %self.goal.id, step = %step_id, error = %e, "cannot record success");
                    return;
                }
                self.step_event(step_id, StepStatus::Succeeded, json!({ "attempts": attempts }));
                if cancelled {
                    return;
                }
                if let Some(observation) = &last {
                    self.remember(step_id, observation, Some(&output));
                    let names = self.rt.planner.invalidated_by(observation, &self.plan);
                    if !names.is_empty() {
                        trigger.get_or_insert(ReplanTrigger::Invalidated {
                            step: step_id,
                            names,
                        });
                    }
                }
            }
            Err(err) => {
                if !cancelled {
                    if let Some(observation) = &last {
                        self.remember(step_id, observation, None);
                    }
                }
                let idempotent = self
                    .plan
                    .get(step_id)
                    .and_then(|s| self.rt.executor.registry().spec(&s.action))
                    .is_some_and(|spec| spec.idempotent);
                match self.rt.recovery.handle(&err, idempotent) {
                    RecoveryAction::Abort(reason) => {
                        self.mark_failed(step_id, &err);
                        fatal.get_or_insert(reason);
                    }
                    RecoveryAction::Stop => self.mark_failed(step_id, &err),
                    RecoveryAction::Replan(_) | RecoveryAction::Retry => {
                        self.fail_step(step_id, &err, trigger)
                    }
                }
            }
        }
    }

    /// 步骤失败：可重规划的失败（或安全拒绝）设置触发器，否则把失败传播给下游
    fn fail_step(&mut self, id: StepId, err: &AgentError, trigger: &mut Option<ReplanTrigger>) {
        self.mark_failed(id, err);
        let replan = matches!(err, AgentError::SafetyDenied { .. })
            || self.plan.get(id).is_some_and(|s| s.replan_on_failure);
        if replan {
            trigger.get_or_insert(ReplanTrigger::StepFailed {
                step: id,
                error: err.clone(),
            });
        } else {
            self.settle_skips();
        }
    }

    fn mark_failed(&mut self, id: StepId, err: &AgentError) {
        if let Err(e) = self.plan.fail(id, err) {
            tracing::error!(goal = %self.goal.id, step = %id, error = %e, "cannot record failure");
            return;
        }
        tracing::info!(goal = %self.goal.id, step = %id, error = %err, "step failed");
        self.step_event(id, StepStatus::Failed, json!({ "error": err.to_string(), "kind": err.kind() }));
    }

    fn settle_skips(&mut self) {
        let skipped = self.plan.propagate_skips();
        for id in skipped {
            self.step_event(id, StepStatus::Skipped, json!({}));
        }
    }

    fn replan(&mut self, trigger: ReplanTrigger) -> Result<(), Outcome> {
        if self.replans >= self.rt.max_replans {
            self.settle_skips();
            return Err(Outcome::failed(format!(
                "re-plan budget exhausted after {} revisions ({})",
                self.replans,
                trigger.describe(&self.plan)
            )));
        }
        self.transition(GoalState::Replanning, Some(trigger.describe(&self.plan)));

        let view = self.rt.memory.view(&self.goal.id, self.rt.memory_budget);
        let result = {
            let request = ReplanRequest {
                goal: &self.goal,
                plan: &self.plan,
                history: &self.history,
                observations: &self.observations,
                memory: &view,
                trigger: &trigger,
            };
            self.rt.planner.replan(&request)
        };

        match result {
            Ok(Replan::Replaced(next)) => {
                self.replans += 1;
                let previous = self.install(next);
                self.history.push(Arc::new(previous));
                self.transition(GoalState::Executing, None);
                Ok(())
            }
            Ok(Replan::Abort(reason)) => {
                self.settle_skips();
                Err(Outcome::failed(reason))
            }
            Err(e) => {
                self.settle_skips();
                Err(Outcome::failed(e.to_string()))
            }
        }
    }

    /// 安装新版本计划，返回被替换的版本
    fn install(&mut self, plan: Plan) -> Plan {
        self.rt.audit.record(
            AuditKind::PlanInstalled,
            &self.goal.id,
            None,
            json!({
                "version": plan.version,
                "steps": plan.steps().iter().map(|s| json!({
                    "id": s.id,
                    "name": s.name,
                    "action": s.action,
                    "status": s.status,
                })).collect::<Vec<_>>(),
            }),
        );
        let previous = std::mem::replace(&mut self.plan, plan);
        self.publish();
        previous
    }

    /// 步骤结果写入 Working（本目标）与 Episodic（会话）
    fn remember(&self, step_id: StepId, observation: &Observation, output: Option<&Value>) {
        let Some(step) = self.plan.get(step_id) else {
            return;
        };
        let key = format!("{}/{}", self.goal.id, step.name);
        let salience = self.rt.memory.salience_for(observation);
        if let Some(output) = output {
            self.rt.memory.put(
                MemoryTier::Working,
                MemoryEntry::new(MemoryTier::Working, key.clone(), output.clone())
                    .with_salience(salience)
                    .for_goal(self.goal.id.clone()),
            );
        }
        self.rt.memory.put(
            MemoryTier::Episodic,
            MemoryEntry::new(
                MemoryTier::Episodic,
                key,
                json!({
                    "goal": self.goal.text,
                    "step": step.name,
                    "action": step.action,
                    "success": observation.success,
                    "payload": observation.payload,
                }),
            )
            .with_salience(salience)
            .for_goal(self.goal.id.clone()),
        );
    }

    /// 目标完成：步骤输出汇总写入 LongTerm
    fn consolidate(&self) {
        let outputs: serde_json::Map<String, Value> = self
            .plan
            .steps()
            .iter()
            .filter_map(|s| s.output.as_ref().map(|o| (s.name.clone(), o.clone())))
            .collect();
        let salience = self
            .observations
            .iter()
            .filter(|o| o.success)
            .map(|o| self.rt.memory.salience_for(o))
            .fold(0.0_f64, f64::max);
        self.rt.memory.put(
            MemoryTier::LongTerm,
            MemoryEntry::new(
                MemoryTier::LongTerm,
                format!("goal/{}", self.goal.id),
                json!({ "goal": self.goal.text, "outputs": outputs }),
            )
            .with_salience(salience)
            .for_goal(self.goal.id.clone()),
        );
    }

    fn finish(mut self, outcome: Outcome) -> GoalState {
        self.commands.close();
        while let Ok(GoalCommand::Amend(updates)) = self.commands.try_recv() {
            tracing::warn!(
                goal = %self.goal.id,
                keys = ?updates.keys().collect::<Vec<_>>(),
                "amendment arrived after the goal finished, dropped"
            );
        }
        if outcome.state == GoalState::Completed {
            self.consolidate();
        }
        let cleared = self.rt.memory.clear_working(&self.goal.id);
        tracing::info!(
            goal = %self.goal.id,
            state = ?outcome.state,
            reason = ?outcome.reason,
            replans = self.replans,
            working_cleared = cleared,
            "goal finished"
        );
        self.transition(outcome.state, outcome.reason);
        self.state
    }

    fn transition(&mut self, next: GoalState, reason: Option<String>) {
        if !self.state.can_transition_to(next) {
            tracing::error!(goal = %self.goal.id, from = ?self.state, to = ?next, "illegal goal transition");
            return;
        }
        self.rt.audit.record(
            AuditKind::GoalState,
            &self.goal.id,
            None,
            json!({ "from": self.state, "to": next, "reason": reason }),
        );
        self.state = next;
        if next.is_terminal() {
            self.status_tx.send_modify(|s| s.reason = reason);
        }
        self.publish();
    }

    fn step_event(&self, id: StepId, status: StepStatus, detail: Value) {
        let name = self.plan.get(id).map(|s| s.name.clone()).unwrap_or_default();
        self.rt.audit.record(
            AuditKind::StepStatus,
            &self.goal.id,
            Some(id),
            json!({ "step": name, "status": status, "detail": detail }),
        );
    }

    /// 发布不可变快照
    fn publish(&self) {
        let plan = (self.plan.version > 0).then(|| Arc::new(self.plan.clone()));
        let observations = self.observations.clone();
        let state = self.state;
        self.status_tx.send_modify(|s| {
            s.state = state;
            s.plan = plan;
            s.observations = observations;
        });
    }
}

/// 解析 `{"$from": "<step>", "pointer": "/a/b"}`：替换为已成功前置步骤的输出（或其子值）
pub(crate) fn resolve_refs(value: &Value, plan: &Plan) -> Result<Value, AgentError> {
    match value {
        Value::Object(map) => {
            if let Some(source) = map.get("$from").and_then(Value::as_str) {
                let extra = map.keys().any(|k| k != "$from" && k != "pointer");
                if !extra {
                    let step = plan
                        .by_name(source)
                        .filter(|s| s.status == StepStatus::Succeeded)
                        .ok_or_else(|| {
                            AgentError::InvalidPlan(format!("'$from' step '{source}' has no output"))
                        })?;
                    let output = step.output.as_ref().unwrap_or(&Value::Null);
                    return match map.get("pointer").and_then(Value::as_str) {
                        Some(pointer) => output.pointer(pointer).cloned().ok_or_else(|| {
                            AgentError::InvalidPlan(format!(
                                "'$from' pointer '{pointer}' not found in output of '{source}'"
                            ))
                        }),
                        None => Ok(output.clone()),
                    };
                }
            }
            map.iter()
                .map(|(k, v)| resolve_refs(v, plan).map(|v| (k.clone(), v)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_refs(v, plan))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}
