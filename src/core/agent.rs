//! AgentCore：目标提交边界
//!
//! 提交目标后立即返回 GoalId；每个目标在独立的后台任务中运行（见 orchestrator），
//! 调用方通过 get_status / wait 读取快照，通过 cancel_goal / amend_goal 干预运行中的目标。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::core::audit::{AuditKind, AuditLog};
use crate::core::orchestrator::{GoalCommand, GoalRun, Runtime};
use crate::core::supervisor::GoalSupervisor;
use crate::core::{AgentBuilder, AgentError, Goal, GoalId, GoalState, GoalStatus};
use crate::config::AppConfig;
use crate::memory::MemoryManager;
use crate::tools::ToolRegistry;

struct GoalHandle {
    status: watch::Receiver<GoalStatus>,
    commands: mpsc::UnboundedSender<GoalCommand>,
}

/// 智能体运行时；可在多个任务间克隆共享
#[derive(Clone)]
pub struct AgentCore {
    rt: Arc<Runtime>,
    supervisor: Arc<GoalSupervisor>,
    goals: Arc<Mutex<HashMap<GoalId, GoalHandle>>>,
}

impl AgentCore {
    pub fn builder(config: AppConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub(crate) fn from_parts(rt: Runtime, supervisor: GoalSupervisor) -> Self {
        Self {
            rt: Arc::new(rt),
            supervisor: Arc::new(supervisor),
            goals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn goals(&self) -> std::sync::MutexGuard<'_, HashMap<GoalId, GoalHandle>> {
        self.goals.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 提交目标，立即返回其 id；目标 id 已存在或运行时已关闭时报错
    pub fn submit_goal(&self, goal: Goal) -> Result<GoalId, AgentError> {
        if self.supervisor.root_token().is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let goal_id = goal.id.clone();
        let initial = GoalStatus {
            goal_id: goal_id.clone(),
            state: GoalState::Created,
            plan: None,
            reason: None,
            observations: Vec::new(),
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let cancel = {
            let mut goals = self.goals();
            if goals.contains_key(&goal_id) {
                return Err(AgentError::InvalidPlan(format!(
                    "goal '{goal_id}' already submitted"
                )));
            }
            goals.insert(
                goal_id.clone(),
                GoalHandle {
                    status: status_rx,
                    commands: cmd_tx,
                },
            );
            self.supervisor.register(&goal_id)
        };

        self.rt.audit.record(
            AuditKind::GoalState,
            &goal_id,
            None,
            json!({ "from": Value::Null, "to": GoalState::Created, "text": goal.text }),
        );
        tracing::info!(goal = %goal_id, text = %goal.text, "goal submitted");

        let run = GoalRun::new(Arc::clone(&self.rt), goal, status_tx, cmd_rx, cancel);
        let supervisor = Arc::clone(&self.supervisor);
        let id = goal_id.clone();
        tokio::spawn(async move {
            run.run().await;
            supervisor.release(&id);
        });
        Ok(goal_id)
    }

    /// 取消目标；已结束的目标不受影响
    pub fn cancel_goal(&self, goal_id: &str) -> Result<(), AgentError> {
        let state = self.get_status(goal_id)?.state;
        if state.is_terminal() {
            return Ok(());
        }
        tracing::info!(goal = %goal_id, "cancel requested");
        self.supervisor.cancel(goal_id);
        Ok(())
    }

    pub fn get_status(&self, goal_id: &str) -> Result<GoalStatus, AgentError> {
        self.goals()
            .get(goal_id)
            .map(|h| h.status.borrow().clone())
            .ok_or_else(|| AgentError::GoalNotFound(goal_id.to_string()))
    }

    /// 等待目标进入终态
    pub async fn wait(&self, goal_id: &str) -> Result<GoalStatus, AgentError> {
        let mut rx = self
            .goals()
            .get(goal_id)
            .map(|h| h.status.clone())
            .ok_or_else(|| AgentError::GoalNotFound(goal_id.to_string()))?;
        if let Ok(status) = rx.wait_for(|s| s.is_terminal()).await {
            return Ok(status.clone());
        }
        // 目标任务已退出而未进入终态（运行时被丢弃）
        let status = rx.borrow().clone();
        Ok(status)
    }

    /// 修订目标上下文；运行中的目标会排空在途步骤后重规划
    ///
    /// 目标在命令入队后、被读取前恰好结束时，修订会被丢弃并记录 warn 日志；
    /// 目标关闭命令通道后再调用则返回错误。
    pub fn amend_goal(&self, goal_id: &str, context: HashMap<String, Value>) -> Result<(), AgentError> {
        let goals = self.goals();
        let handle = goals
            .get(goal_id)
            .ok_or_else(|| AgentError::GoalNotFound(goal_id.to_string()))?;
        let state = handle.status.borrow().state;
        if state.is_terminal() {
            return Err(AgentError::InvalidPlan(format!(
                "goal '{goal_id}' already {state:?}"
            )));
        }
        handle
            .commands
            .send(GoalCommand::Amend(context))
            .map_err(|_| AgentError::InvalidPlan(format!("goal '{goal_id}' already finished")))
    }

    /// 释放已结束目标的句柄与审计事件，返回其最终状态；未结束的目标报错
    ///
    /// 长期运行的进程应在读取结果后调用，否则每个目标的计划、Observation 与审计事件会一直保留。
    pub fn forget_goal(&self, goal_id: &str) -> Result<GoalStatus, AgentError> {
        let status = {
            let mut goals = self.goals();
            let state = goals
                .get(goal_id)
                .map(|h| h.status.borrow().state)
                .ok_or_else(|| AgentError::GoalNotFound(goal_id.to_string()))?;
            if !state.is_terminal() {
                return Err(AgentError::InvalidPlan(format!(
                    "goal '{goal_id}' still {state:?}"
                )));
            }
            goals
                .remove(goal_id)
                .map(|h| h.status.borrow().clone())
                .ok_or_else(|| AgentError::GoalNotFound(goal_id.to_string()))?
        };
        let events = self.rt.audit.forget(goal_id);
        tracing::debug!(goal = %goal_id, events, "goal forgotten");
        Ok(status)
    }

    pub fn goal_ids(&self) -> Vec<GoalId> {
        self.goals().keys().cloned().collect()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::clone(&self.rt.audit)
    }

    pub fn memory(&self) -> Arc<MemoryManager> {
        Arc::clone(&self.rt.memory)
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(self.rt.executor.registry())
    }

    /// 取消全部运行中的目标，之后不再接受新目标
    pub fn shutdown(&self) {
        tracing::info!(active = self.supervisor.active(), "agent shutting down");
        self.supervisor.shutdown();
    }
}
