//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AGNES__*` 覆盖（双下划线表示嵌套，如 `AGNES__AGENT__MAX_IN_FLIGHT=8`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::plan::{FailurePolicy, PlanTemplate};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub executor: ExecutorSection,
    pub memory: MemorySection,
    pub safety: SafetySection,
    pub planner: PlannerSection,
    pub tools: ToolsSection,
}

/// [agent] 段：调度并发、重规划次数、规划时的记忆预算
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// 单个目标同时在途的步骤数上限
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// 进程内所有目标共享的在途上限；不设置则不限制
    #[serde(default)]
    pub global_max_in_flight: Option<usize>,
    /// 单个目标最多重规划次数（规划深度）
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// 规划时召回的 Episodic / LongTerm 条目数
    #[serde(default = "default_memory_budget")]
    pub memory_budget: usize,
}

fn default_max_in_flight() -> usize {
    4
}

fn default_max_replans() -> u32 {
    5
}

fn default_memory_budget() -> usize {
    8
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            global_max_in_flight: None,
            max_replans: default_max_replans(),
            memory_budget: default_memory_budget(),
        }
    }
}

/// [executor] 段：重试与退避、默认超时
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// 工具未声明超时时使用（秒）
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5000
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

/// [memory] 段：各层容量、显著度策略参数、持久化目录
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_episodic_capacity")]
    pub episodic_capacity: usize,
    #[serde(default = "default_long_term_capacity")]
    pub long_term_capacity: usize,
    #[serde(default = "default_base_salience")]
    pub base_salience: f64,
    #[serde(default = "default_success_boost")]
    pub success_boost: f64,
    /// 未设置时不落盘
    #[serde(default)]
    pub persistence_dir: Option<PathBuf>,
}

fn default_episodic_capacity() -> usize {
    256
}

fn default_long_term_capacity() -> usize {
    1024
}

fn default_base_salience() -> f64 {
    0.5
}

fn default_success_boost() -> f64 {
    0.2
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            episodic_capacity: default_episodic_capacity(),
            long_term_capacity: default_long_term_capacity(),
            base_salience: default_base_salience(),
            success_boost: default_success_boost(),
            persistence_dir: None,
        }
    }
}

/// [safety] 段：启用的规则与各规则参数
#[derive(Debug, Clone, Deserialize)]
pub struct SafetySection {
    /// 启用的内置规则：policy / quota / shape
    #[serde(default = "default_checks")]
    pub checks: Vec<String>,
    /// 禁止调用的动作名
    #[serde(default)]
    pub blocked_actions: Vec<String>,
    /// 参数中禁止出现的词（正则）
    #[serde(default)]
    pub blocked_terms: Vec<String>,
    /// 单个目标内同一动作的派发上限
    #[serde(default)]
    pub max_calls_per_action: Option<u32>,
    /// 字符串参数最大长度，超出时截断
    #[serde(default = "default_max_param_chars")]
    pub max_param_chars: usize,
}

fn default_checks() -> Vec<String> {
    vec!["policy".into(), "quota".into(), "shape".into()]
}

fn default_max_param_chars() -> usize {
    4096
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            checks: default_checks(),
            blocked_actions: Vec::new(),
            blocked_terms: Vec::new(),
            max_calls_per_action: None,
            max_param_chars: default_max_param_chars(),
        }
    }
}

/// [planner] 段：失败处理策略与计划模板
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerSection {
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,
    #[serde(default)]
    pub templates: Vec<PlanTemplate>,
}

fn default_max_step_retries() -> u32 {
    1
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            on_failure: FailurePolicy::default(),
            max_step_retries: default_max_step_retries(),
            templates: Vec::new(),
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolsSection {
    #[serde(default)]
    pub http: HttpSection,
}

/// [tools.http] 段：抓取 URL 的超时、最大字符数、允许的域名白名单
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
}

fn default_http_timeout_secs() -> u64 {
    15
}

fn default_max_result_chars() -> usize {
    8000
}

fn default_allowed_domains() -> Vec<String> {
    vec![
        "en.wikipedia.org".into(),
        "docs.rs".into(),
        "doc.rust-lang.org".into(),
        "github.com".into(),
        "raw.githubusercontent.com".into(),
        "arxiv.org".into(),
        "example.com".into(),
    ]
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout_secs(),
            max_result_chars: default_max_result_chars(),
            allowed_domains: default_allowed_domains(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 AGNES__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AGNES__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AGNES")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 只从单个文件加载（不读默认文件与环境变量）
pub fn load_config_file(path: impl Into<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from(path.into()))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_in_flight, 4);
        assert_eq!(cfg.agent.max_replans, 5);
        assert_eq!(cfg.executor.max_retries, 3);
        assert_eq!(cfg.safety.checks, vec!["policy", "quota", "shape"]);
        assert_eq!(cfg.planner.on_failure, FailurePolicy::Abort);
        assert!(cfg.memory.persistence_dir.is_none());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agnes.toml");
        std::fs::write(
            &path,
            r#"
[agent]
max_in_flight = 2

[executor]
max_retries = 5

[planner]
on_failure = "retry"

[[planner.templates]]
name = "fetch-and-summarize"
keywords = ["summarize"]

[[planner.templates.steps]]
name = "fetch"
action = "http_fetch"
params = { url = { "$goal" = "url" } }

[[planner.templates.steps]]
name = "summarize"
action = "summarize"
depends_on = ["fetch"]
params = { text = { "$from" = "fetch" } }
"#,
        )
        .unwrap();

        let cfg = load_config_file(path).unwrap();
        assert_eq!(cfg.agent.max_in_flight, 2);
        assert_eq!(cfg.executor.max_retries, 5);
        assert_eq!(cfg.executor.backoff_base_ms, 100);
        assert_eq!(cfg.planner.on_failure, FailurePolicy::Retry);
        assert_eq!(cfg.planner.templates.len(), 1);
        let steps = &cfg.planner.templates[0].steps;
        assert_eq!(steps[1].depends_on, vec!["fetch".to_string()]);
        assert_eq!(steps[0].params["url"]["$goal"], "url");
    }
}
