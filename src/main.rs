//! Agnes - 目标驱动的自主任务编排运行时
//!
//! 入口：加载配置、初始化日志、构建 AgentCore，提交命令行给出的目标并等待其结束。
//!
//! ```text
//! agnes "summarize https://example.com"
//! ```

use std::sync::Arc;

use anyhow::Context;
use agnes::core::{run_until_shutdown, GoalDrain, MemoryFlush, ShutdownCoordinator, ShutdownManager};
use agnes::{load_config, observability, AgentCore, Goal};
use serde_json::Value;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(None).context("Failed to load config")?;
    observability::init();

    let text = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if text.trim().is_empty() {
        anyhow::bail!("usage: agnes \"<goal text>\"");
    }

    let shutdown = Arc::new(ShutdownManager::new());
    let agent = AgentCore::builder(config)
        .root_token(shutdown.token())
        .build()
        .context("Failed to build agent")?;

    let memory = agent.memory();
    match memory.restore() {
        Ok(n) => tracing::info!(entries = n, "memory restored"),
        Err(e) => tracing::warn!("memory restore failed: {}", e),
    }

    let mut goal = Goal::new(text.clone());
    if let Some(url) = first_url(&text) {
        goal = goal.with_context("url", Value::String(url));
    }

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(GoalDrain::new(agent.clone()));
    coordinator.register(MemoryFlush::new(Arc::clone(&memory)));

    let goal_id = agent.submit_goal(goal).context("Failed to submit goal")?;
    let runner = agent.clone();
    let status = run_until_shutdown(
        Arc::clone(&shutdown),
        async move { runner.wait(&goal_id).await },
        &coordinator,
    )
    .await;

    match status {
        Some(status) => {
            let status = status?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        None => tracing::info!(reason = ?shutdown.reason(), "interrupted before the goal finished"),
    }
    Ok(())
}

/// 从目标文本中取出第一个 http(s) 链接
fn first_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|w| w.starts_with("http://") || w.starts_with("https://"))
        .map(|w| w.trim_end_matches(|c: char| matches!(c, '.' | ',' | ')' | '"')).to_string())
}
