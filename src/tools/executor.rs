//! 工具执行器
//!
//! 持有 ToolRegistry 与重试策略，invoke 在超时内调用工具，每次尝试生成一条 Observation 并写入审计日志。
//! 幂等工具遇到瞬时错误（超时 / 瞬时失败）按指数退避重试；非幂等工具从不自动重试。
//! 取消或超时时可取消的调用被中止；不可取消的调用继续在后台运行，结果作为 LateObservation 只记录审计。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorSection;
use crate::core::audit::{AuditKind, AuditLog};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine, ToolError};
use crate::plan::StepId;
use crate::tools::{schema, Observation, ToolRegistry, ToolSpec};

/// 重试与退避：第 n 次重试前等待 base * 2^n，封顶 max
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &ExecutorSection) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base: Duration::from_millis(cfg.backoff_base_ms),
            max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// 一次派发的完整结果：所有尝试的 Observation + 最终结果
#[derive(Debug)]
pub struct Invocation {
    pub observations: Vec<Observation>,
    pub outcome: Result<Value, AgentError>,
}

impl Invocation {
    pub fn attempts(&self) -> u32 {
        self.observations.len() as u32
    }
}

/// 一次派发的输入
#[derive(Debug, Clone)]
pub struct ToolCall<'a> {
    pub goal_id: &'a str,
    pub step_id: StepId,
    pub action: &'a str,
    pub params: Value,
    /// 步骤级超时，优先于工具声明
    pub timeout: Option<Duration>,
}

enum Attempt {
    Finished(Result<Value, AgentError>),
    Cancelled,
}

pub struct Executioner {
    registry: Arc<ToolRegistry>,
    retry: RetryPolicy,
    default_timeout: Duration,
    recovery: RecoveryEngine,
    audit: Arc<AuditLog>,
}

impl Executioner {
    pub fn new(
        registry: Arc<ToolRegistry>,
        retry: RetryPolicy,
        default_timeout: Duration,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            registry,
            retry,
            default_timeout,
            recovery: RecoveryEngine::new(),
            audit,
        }
    }

    pub fn from_config(registry: Arc<ToolRegistry>, cfg: &ExecutorSection, audit: Arc<AuditLog>) -> Self {
        Self::new(
            registry,
            RetryPolicy::from_config(cfg),
            Duration::from_secs(cfg.default_timeout_secs),
            audit,
        )
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn invoke(&self, call: ToolCall<'_>, cancel: &CancellationToken) -> Invocation {
        let mut observations = Vec::new();

        let Some(spec) = self.registry.spec(call.action) else {
            let outcome = Err(AgentError::UnknownTool(call.action.to_string()));
            observations.push(self.observe(&call, 1, &outcome, 0));
            return Invocation {
                observations,
                outcome,
            };
        };

        if let Err(reason) = schema::validate(&spec.input_schema, &call.params) {
            let outcome = Err(ToolError::InvalidInput(reason).into_agent_error(call.action));
            observations.push(self.observe(&call, 1, &outcome, 0));
            return Invocation {
                observations,
                outcome,
            };
        }

        let timeout = call.timeout.or(spec.timeout).unwrap_or(self.default_timeout);
        let mut attempt: u32 = 0;
        let outcome = loop {
            if cancel.is_cancelled() {
                break Err(AgentError::Cancelled);
            }
            attempt += 1;
            let started = Instant::now();
            let result = match self.attempt(&call, &spec, attempt, timeout, cancel).await {
                Attempt::Finished(result) => result,
                Attempt::Cancelled => {
                    let result = Err(AgentError::Cancelled);
                    observations.push(self.observe(&call, attempt, &result, elapsed_ms(started)));
                    break result;
                }
            };
            observations.push(self.observe(&call, attempt, &result, elapsed_ms(started)));

            let err = match result {
                Ok(value) => break Ok(value),
                Err(err) => err,
            };
            let retries = attempt - 1;
            if retries >= self.retry.max_retries
                || self.recovery.handle(&err, spec.idempotent) != RecoveryAction::Retry
            {
                break Err(err);
            }

            let delay = self.retry.backoff(retries);
            tracing::debug!(
                tool = %call.action,
                step = %call.step_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient error"
            );
            tokio::select! {
                _ = cancel.cancelled() => break Err(AgentError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        Invocation {
            observations,
            outcome,
        }
    }

    async fn attempt(
        &self,
        call: &ToolCall<'_>,
        spec: &ToolSpec,
        attempt: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Attempt {
        let Some(tool) = self.registry.get(call.action) else {
            return Attempt::Finished(Err(AgentError::UnknownTool(call.action.to_string())));
        };
        let params = call.params.clone();
        let mut handle: JoinHandle<Result<Value, ToolError>> =
            tokio::spawn(async move { tool.execute(params).await });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if spec.cancellable {
                    handle.abort();
                } else {
                    self.watch_late(call, attempt, handle);
                }
                Attempt::Cancelled
            }
            joined = tokio::time::timeout(timeout, &mut handle) => {
                let result = match joined {
                    Ok(Ok(result)) => result.map_err(|e| e.into_agent_error(call.action)),
                    Ok(Err(join_err)) => Err(AgentError::ToolFailure {
                        tool: call.action.to_string(),
                        message: format!("tool task aborted: {join_err}"),
                        transient: false,
                    }),
                    Err(_) => {
                        if spec.cancellable {
                            handle.abort();
                        } else {
                            tracing::warn!(tool = %call.action, "timed out non-cancellable call left running");
                        }
                        Err(AgentError::Timeout(call.action.to_string()))
                    }
                };
                Attempt::Finished(result)
            }
        }
    }

    /// 目标已取消但调用不可中止：后台等待结果，只写审计，不回写计划或记忆
    fn watch_late(&self, call: &ToolCall<'_>, attempt: u32, handle: JoinHandle<Result<Value, ToolError>>) {
        let audit = Arc::clone(&self.audit);
        let goal_id = call.goal_id.to_string();
        let step_id = call.step_id;
        let action = call.action.to_string();
        let started = Instant::now();
        tokio::spawn(async move {
            let result = match handle.await {
                Ok(result) => result.map_err(|e| e.into_agent_error(&action)),
                Err(join_err) => Err(AgentError::ToolFailure {
                    tool: action.clone(),
                    message: format!("tool task aborted: {join_err}"),
                    transient: false,
                }),
            };
            let mut observation = Observation::from_result(
                &goal_id,
                step_id,
                &action,
                attempt,
                &result,
                elapsed_ms(started),
            );
            observation.late = true;
            tracing::info!(goal = %goal_id, step = %step_id, tool = %action, "late observation after cancel");
            audit.record(
                AuditKind::LateObservation,
                &goal_id,
                Some(step_id),
                serde_json::to_value(&observation).unwrap_or(Value::Null),
            );
        });
    }

    fn observe(
        &self,
        call: &ToolCall<'_>,
        attempt: u32,
        result: &Result<Value, AgentError>,
        latency_ms: u64,
    ) -> Observation {
        let observation =
            Observation::from_result(call.goal_id, call.step_id, call.action, attempt, result, latency_ms);
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.action,
            "ok": observation.success,
            "attempt": attempt,
            "duration_ms": latency_ms,
            "args_preview": args_preview(&call.params),
        });
        tracing::debug!(audit = %audit, "tool");
        self.audit.record(
            AuditKind::Observation,
            call.goal_id,
            Some(call.step_id),
            serde_json::to_value(&observation).unwrap_or(Value::Null),
        );
        observation
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
