//! 优雅关闭
//!
//! 根 CancellationToken 由 ShutdownManager 持有，AgentCore 的目标 token 都从它派生：
//! 信号到达后先取消全部目标并等待其收尾（GoalDrain），再把 Episodic / LongTerm 落盘（MemoryFlush）。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::AgentCore;
use crate::memory::MemoryManager;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 持有运行时根 token；只记录第一次关闭的原因
#[derive(Clone)]
pub struct ShutdownManager {
    root: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            reason: watch::Sender::new(None),
        }
    }

    /// 运行时根 token（交给 AgentBuilder::root_token）
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if first {
            tracing::info!(reason = ?reason, "shutdown requested");
        }
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.root.cancelled().await;
    }

    /// 后台监听 Ctrl+C 与 SIGTERM；关闭后监听任务随之退出
    pub fn listen_for_signals(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = manager.root.cancelled() => return,
                Ok(()) = tokio::signal::ctrl_c() => ShutdownReason::UserInitiated,
                _ = terminate() => ShutdownReason::Signal,
            };
            tracing::info!(reason = ?reason, "signal received, shutting down");
            manager.shutdown(reason);
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// 关闭时执行的清理步骤
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

/// 一次清理的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub succeeded: Vec<String>,
    /// (名称, 失败或超时原因)
    pub failed: Vec<(String, String)>,
}

/// 按注册顺序执行清理；单步失败或超时不影响后续步骤
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    steps: Vec<Box<dyn ShutdownCleanup>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            steps: Vec::new(),
            step_timeout: Duration::from_secs(5),
        }
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn register(&mut self, step: impl ShutdownCleanup + 'static) {
        self.steps.push(Box::new(step));
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    pub async fn run_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for step in &self.steps {
            let name = step.name().to_string();
            let outcome = match tokio::time::timeout(self.step_timeout, step.run()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(_) => Err(format!("timed out after {:?}", self.step_timeout)),
            };
            match outcome {
                Ok(()) => {
                    tracing::info!(step = %name, "cleanup done");
                    report.succeeded.push(name);
                }
                Err(reason) => {
                    tracing::warn!(step = %name, reason = %reason, "cleanup failed");
                    report.failed.push((name, reason));
                }
            }
        }
        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "cleanup finished"
        );
        report
    }
}

/// 取消所有未结束的目标并等待它们进入终态
pub struct GoalDrain {
    agent: AgentCore,
}

impl GoalDrain {
    pub fn new(agent: AgentCore) -> Self {
        Self { agent }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for GoalDrain {
    fn name(&self) -> &str {
        "goal_drain"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.agent.shutdown();
        for goal_id in self.agent.goal_ids() {
            let status = self.agent.wait(&goal_id).await?;
            tracing::debug!(goal = %goal_id, state = ?status.state, "goal drained");
        }
        Ok(())
    }
}

/// Episodic / LongTerm 落盘
pub struct MemoryFlush {
    memory: Arc<MemoryManager>,
}

impl MemoryFlush {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for MemoryFlush {
    fn name(&self) -> &str {
        "memory_flush"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.memory.flush()?;
        Ok(())
    }
}

/// 运行 app 直到完成或收到关闭信号，然后执行清理；被信号打断时返回 None
pub async fn run_until_shutdown<F, T>(
    manager: Arc<ShutdownManager>,
    app: F,
    coordinator: &ShutdownCoordinator,
) -> Option<T>
where
    F: Future<Output = T>,
{
    manager.listen_for_signals();

    let output = tokio::select! {
        out = app => Some(out),
        _ = manager.wait_for_shutdown() => None,
    };
    let report = coordinator.run_cleanup().await;
    if !report.failed.is_empty() {
        tracing::warn!(failed = ?report.failed, "some cleanup steps failed");
    }
    output
}
