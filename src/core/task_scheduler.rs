//! 任务调度：步骤派发的并发许可
//!
//! 单目标的在途上限由目标任务自身计数；进程级上限（可选）由共享 Semaphore 限制，所有目标竞争同一组许可。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::AgentSection;
use crate::core::AgentError;

/// 派发许可；全局不限流时为空许可
#[derive(Debug)]
pub struct DispatchPermit {
    _global: Option<OwnedSemaphorePermit>,
}

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 单目标同时在途的步骤数
    max_in_flight: usize,
    /// 跨目标共享的许可（None 表示不限制）
    global: Option<Arc<Semaphore>>,
}

impl TaskScheduler {
    pub fn new(max_in_flight: usize, global_max_in_flight: Option<usize>) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            global: global_max_in_flight.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    pub fn from_config(cfg: &AgentSection) -> Self {
        Self::new(cfg.max_in_flight, cfg.global_max_in_flight)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// 当前目标还能派发多少个步骤
    pub fn free_slots(&self, in_flight: usize) -> usize {
        self.max_in_flight.saturating_sub(in_flight)
    }

    /// 获取全局派发许可；等待期间目标被取消则返回 Cancelled
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<DispatchPermit, AgentError> {
        let Some(global) = &self.global else {
            return Ok(DispatchPermit { _global: None });
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            permit = Arc::clone(global).acquire_owned() => permit
                .map(|p| DispatchPermit { _global: Some(p) })
                .map_err(|_| AgentError::Cancelled),
        }
    }

    pub fn available_global(&self) -> Option<usize> {
        self.global.as_ref().map(|s| s.available_permits())
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::from_config(&AgentSection::default())
    }
}
