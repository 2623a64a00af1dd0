//! 核心编排层：错误与恢复、目标状态、审计、调度与取消、主控循环

pub mod agent;
pub mod audit;
pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod task_scheduler;

pub use agent::AgentCore;
pub use audit::{AuditEvent, AuditKind, AuditLog, AuditSink, TracingSink};
pub use builder::AgentBuilder;
pub use error::{AgentError, ErrorKind, RecoveryAction, ToolError};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    run_until_shutdown, CleanupReport, GoalDrain, MemoryFlush, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
pub use state::{Goal, GoalId, GoalState, GoalStatus};
pub use supervisor::GoalSupervisor;
pub use task_scheduler::{DispatchPermit, TaskScheduler};
