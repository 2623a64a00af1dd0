//! Agent 构建器：统一的 AgentCore 初始化逻辑
//!
//! 默认从 AppConfig 组装全部组件（内置工具、模板策略、内置安全规则、配置的记忆后端）；
//! 嵌入方可以替换工具注册表、规划策略、记忆管理器，追加安全规则与审计 sink。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::audit::{AuditLog, AuditSink, TracingSink};
use crate::core::orchestrator::Runtime;
use crate::core::supervisor::GoalSupervisor;
use crate::core::task_scheduler::TaskScheduler;
use crate::core::{AgentCore, AgentError, RecoveryEngine};
use crate::memory::MemoryManager;
use crate::plan::{PlanStrategy, TaskPlanner, TemplateStrategy};
use crate::safety::{SafetyMonitor, SafetyRule};
use crate::tools::{builtin_registry, Executioner, Tool, ToolRegistry};

/// Agent 构建器
pub struct AgentBuilder {
    config: AppConfig,
    registry: Option<ToolRegistry>,
    extra_tools: Vec<Arc<dyn Tool>>,
    strategy: Option<Arc<dyn PlanStrategy>>,
    rules: Vec<Arc<dyn SafetyRule>>,
    memory: Option<Arc<MemoryManager>>,
    sinks: Vec<Arc<dyn AuditSink>>,
    tracing_sink: bool,
    root: Option<CancellationToken>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            extra_tools: Vec::new(),
            strategy: None,
            rules: Vec::new(),
            memory: None,
            sinks: Vec::new(),
            tracing_sink: true,
            root: None,
        }
    }

    /// 替换内置工具注册表
    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 在注册表之上追加工具（同名覆盖）
    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.extra_tools.push(Arc::new(tool));
        self
    }

    /// 替换默认的模板分解策略
    pub fn strategy(mut self, strategy: Arc<dyn PlanStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// 追加自定义安全规则（按阶段与内置规则一起排序）
    pub fn rule(mut self, rule: Arc<dyn SafetyRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// 共享外部创建的记忆管理器
    pub fn memory(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// 是否把审计事件同时写入 tracing（默认开启）
    pub fn with_tracing_sink(mut self, enable: bool) -> Self {
        self.tracing_sink = enable;
        self
    }

    /// 使用外部根 token（如 ShutdownManager::token），关闭时级联取消全部目标
    pub fn root_token(mut self, token: CancellationToken) -> Self {
        self.root = Some(token);
        self
    }

    /// 构建统一的工具注册表
    fn build_tool_registry(&mut self) -> ToolRegistry {
        let mut tools = self
            .registry
            .take()
            .unwrap_or_else(|| builtin_registry(&self.config.tools));
        for tool in self.extra_tools.drain(..) {
            tools.register_arc(tool);
        }
        tools
    }

    pub fn build(mut self) -> Result<AgentCore, AgentError> {
        let registry = Arc::new(self.build_tool_registry());

        let mut audit = AuditLog::new();
        if self.tracing_sink {
            audit = audit.with_sink(Arc::new(TracingSink));
        }
        for sink in self.sinks.drain(..) {
            audit = audit.with_sink(sink);
        }
        let audit = Arc::new(audit);

        let mut safety = SafetyMonitor::from_config(&self.config.safety)?.with_audit(Arc::clone(&audit));
        for rule in self.rules.drain(..) {
            safety.push(rule);
        }

        let strategy = self
            .strategy
            .take()
            .unwrap_or_else(|| Arc::new(TemplateStrategy::from_config(&self.config.planner)));

        let memory = self
            .memory
            .take()
            .unwrap_or_else(|| Arc::new(MemoryManager::from_config(&self.config.memory)));

        let executor = Executioner::from_config(registry, &self.config.executor, Arc::clone(&audit));

        tracing::info!(
            tools = ?executor.registry().names(),
            rules = ?safety.rule_names(),
            max_in_flight = self.config.agent.max_in_flight,
            "agent runtime built"
        );

        let rt = Runtime {
            planner: TaskPlanner::new(strategy),
            safety,
            executor: Arc::new(executor),
            memory,
            audit,
            scheduler: TaskScheduler::from_config(&self.config.agent),
            recovery: RecoveryEngine::new(),
            max_replans: self.config.agent.max_replans,
            memory_budget: self.config.agent.memory_budget,
        };
        let supervisor = GoalSupervisor::new(self.root.take().unwrap_or_default());
        Ok(AgentCore::from_parts(rt, supervisor))
    }
}
