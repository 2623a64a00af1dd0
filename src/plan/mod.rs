//! 计划层：步骤 DAG、构建与校验、分解策略与重规划

pub mod builder;
pub mod graph;
pub mod planner;
pub mod template;
pub mod types;

pub use builder::PlanBuilder;
pub use graph::PlanGraph;
pub use planner::{
    live_specs, PlanStrategy, Replan, ReplanRequest, ReplanTrigger, Revision, TaskPlanner,
};
pub use template::{FailurePolicy, PlanTemplate, TemplateStrategy};
pub use types::{Plan, Step, StepId, StepSpec, StepStatus};
