//! 端到端场景测试：通过 AgentCore 提交目标，观察状态、审计与记忆

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agnes::config::{load_config_file, AppConfig};
use agnes::core::{AgentCore, AgentError, AuditKind, Goal, GoalState, ToolError};
use agnes::memory::{MemoryEntry, MemoryTier, MemoryView};
use agnes::plan::{FailurePolicy, PlanStrategy, PlanTemplate, StepSpec, TemplateStrategy};
use agnes::tools::{FnTool, SummarizeTool, ToolRegistry, ToolSpec};
use serde_json::{json, Value};
use tokio::sync::Notify;

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.executor.backoff_base_ms = 1;
    cfg.executor.backoff_max_ms = 5;
    cfg.executor.default_timeout_secs = 5;
    cfg
}

/// 固定分解结果；修订使用默认行为
struct Fixed(Vec<StepSpec>);

impl PlanStrategy for Fixed {
    fn decompose(&self, _goal: &Goal, _memory: &MemoryView) -> Result<Vec<StepSpec>, AgentError> {
        Ok(self.0.clone())
    }
}

fn sleeper(name: &str, ms: u64) -> FnTool {
    FnTool::new(ToolSpec::new(name, "sleeps then echoes"), move |params| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(params)
    })
}

#[tokio::test]
async fn test_fetch_and_summarize_with_transient_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let fetch = FnTool::new(
        ToolSpec::new("http_fetch", "fake fetch").idempotent(true),
        move |_params| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(ToolError::Transient("connection reset".into()));
                }
                Ok(json!({
                    "url": "https://example.com",
                    "status": 200,
                    "text": "Rust is fast. It is memory safe. It has great tooling. Nothing else matters."
                }))
            }
        },
    );

    let mut cfg = test_config();
    cfg.planner.templates = vec![PlanTemplate {
        name: "fetch-and-summarize".into(),
        keywords: vec!["summarize".into()],
        steps: vec![
            StepSpec::new("fetch", "http_fetch").params(json!({"url": {"$goal": "url"}})),
            StepSpec::new("summarize", "summarize")
                .after("fetch")
                .params(json!({"text": {"$from": "fetch", "pointer": "/text"}, "max_sentences": 2})),
        ],
    }];

    let agent = AgentCore::builder(cfg)
        .registry(ToolRegistry::new())
        .tool(fetch)
        .tool(SummarizeTool)
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let goal = Goal::new("summarize https://example.com").with_context("url", json!("https://example.com"));
    let id = agent.submit_goal(goal).unwrap();
    let status = agent.wait(&id).await.unwrap();

    assert_eq!(status.state, GoalState::Completed, "reason: {:?}", status.reason);
    let fetches: Vec<_> = status.observations.iter().filter(|o| o.tool == "http_fetch").collect();
    assert_eq!(fetches.len(), 3);
    assert_eq!(
        fetches.iter().map(|o| o.retry_count).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(!fetches[0].success && fetches[2].success);

    let audited = agent.audit().events_of(&id, AuditKind::Observation);
    let audited_by = |tool: &str| audited.iter().filter(|e| e.payload["tool"] == json!(tool)).count();
    assert_eq!(audited.len(), 4);
    assert_eq!(audited_by("http_fetch"), 3);
    assert_eq!(audited_by("summarize"), 1);

    let summaries: Vec<_> = status.observations.iter().filter(|o| o.tool == "summarize").collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(
        summaries[0].payload["summary"],
        json!("Rust is fast. It is memory safe.")
    );

    let memory = agent.memory();
    let stored = memory.get(MemoryTier::LongTerm, &format!("goal/{id}")).unwrap();
    assert!(stored.value["outputs"]["summarize"].is_object());
    assert!(memory.get(MemoryTier::Episodic, &format!("{id}/fetch")).is_some());
    assert_eq!(memory.len(MemoryTier::Working), 0);
}

#[tokio::test]
async fn test_cancel_with_non_cancellable_step_in_flight() {
    let started = Arc::new(Notify::new());
    let signal = Arc::clone(&started);
    let slow = FnTool::new(
        ToolSpec::new("summarize", "slow, cannot be interrupted").cancellable(false),
        move |_params| {
            let signal = Arc::clone(&signal);
            async move {
                signal.notify_one();
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(json!({"summary": "late"}))
            }
        },
    );

    let agent = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .tool(slow)
        .strategy(Arc::new(Fixed(vec![StepSpec::new("summarize", "summarize")])))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let id = agent.submit_goal(Goal::new("summarize slowly")).unwrap();
    started.notified().await;
    agent.cancel_goal(&id).unwrap();

    let status = agent.wait(&id).await.unwrap();
    assert_eq!(status.state, GoalState::Cancelled);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let audit = agent.audit();
    let late = audit.events_of(&id, AuditKind::LateObservation);
    assert_eq!(late.len(), 1);
    assert!(agent
        .memory()
        .get(MemoryTier::Episodic, &format!("{id}/summarize"))
        .is_none());

    // 已结束的目标再次取消不报错
    agent.cancel_goal(&id).unwrap();
}

#[tokio::test]
async fn test_safety_deny_short_circuits() {
    let executed = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&executed);
    let shell = FnTool::new(ToolSpec::new("shell", "never allowed"), move |_params| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(json!("ran")) }
    });

    let mut cfg = test_config();
    cfg.safety.blocked_actions = vec!["shell".into()];
    let agent = AgentCore::builder(cfg)
        .registry(ToolRegistry::new())
        .tool(shell)
        .strategy(Arc::new(Fixed(vec![StepSpec::new("run", "shell")])))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let id = agent.submit_goal(Goal::new("run a shell command")).unwrap();
    let status = agent.wait(&id).await.unwrap();

    assert_eq!(status.state, GoalState::Failed);
    assert_eq!(executed.load(Ordering::SeqCst), 0);
    let audit = agent.audit();
    let verdicts = audit.events_of(&id, AuditKind::SafetyVerdict);
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].payload["rule"], json!("policy"));
    assert_eq!(verdicts[0].payload["decision"], json!("deny"));
    assert!(audit.events_of(&id, AuditKind::Observation).is_empty());
}

#[tokio::test]
async fn test_dependencies_succeed_before_dependents_run() {
    let agent = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .tool(sleeper("work", 20))
        .strategy(Arc::new(Fixed(vec![
            StepSpec::new("a", "work"),
            StepSpec::new("b", "work").after("a"),
            StepSpec::new("c", "work").after("a").priority(5),
            StepSpec::new("d", "work").after("b").after("c"),
        ])))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let id = agent.submit_goal(Goal::new("diamond")).unwrap();
    let status = agent.wait(&id).await.unwrap();
    assert_eq!(status.state, GoalState::Completed);

    let plan = status.plan.unwrap();
    let events = agent.audit().events_of(&id, AuditKind::StepStatus);
    let seq_of = |step, state: &str| {
        events
            .iter()
            .find(|e| e.step_id == Some(step) && e.payload["status"] == json!(state))
            .map(|e| e.seq)
    };
    for step in plan.steps() {
        let running = seq_of(step.id, "running").unwrap();
        for dep in &step.depends_on {
            let done = seq_of(*dep, "succeeded").unwrap();
            assert!(done < running, "step {} ran before its dependency {}", step.name, dep);
        }
    }

    // 同时 Ready 时优先级高的先派发
    let b = plan.by_name("b").unwrap().id;
    let c = plan.by_name("c").unwrap().id;
    assert!(seq_of(c, "running").unwrap() < seq_of(b, "running").unwrap());
}

#[tokio::test]
async fn test_max_in_flight_bounds_concurrency() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (cur, top) = (Arc::clone(&current), Arc::clone(&peak));
    let tool = FnTool::new(ToolSpec::new("work", "tracks concurrency"), move |_params| {
        let (cur, top) = (Arc::clone(&cur), Arc::clone(&top));
        async move {
            let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
            top.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            cur.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    });

    let mut cfg = test_config();
    cfg.agent.max_in_flight = 2;
    let agent = AgentCore::builder(cfg)
        .registry(ToolRegistry::new())
        .tool(tool)
        .strategy(Arc::new(Fixed(
            (0..5).map(|i| StepSpec::new(format!("w{i}"), "work")).collect(),
        )))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let id = agent.submit_goal(Goal::new("parallel work")).unwrap();
    let status = agent.wait(&id).await.unwrap();
    assert_eq!(status.state, GoalState::Completed);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_cycle_fails_before_execution() {
    let agent = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .tool(sleeper("work", 1))
        .strategy(Arc::new(Fixed(vec![
            StepSpec::new("a", "work").after("b"),
            StepSpec::new("b", "work").after("a"),
        ])))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let id = agent.submit_goal(Goal::new("loop forever")).unwrap();
    let status = agent.wait(&id).await.unwrap();

    assert_eq!(status.state, GoalState::Failed);
    assert!(status.reason.unwrap().contains("cycle"));
    assert!(status.plan.is_none());
    assert!(agent.audit().events_of(&id, AuditKind::Observation).is_empty());
}

#[tokio::test]
async fn test_unwired_from_reference_fails_before_execution() {
    let executed = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&executed);
    let echo = FnTool::new(ToolSpec::new("echo", "counts calls"), move |params| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(params) }
    });

    let agent = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .tool(echo)
        .strategy(Arc::new(Fixed(vec![
            StepSpec::new("a", "echo").params(json!({"text": "hi"})),
            StepSpec::new("b", "echo").params(json!({"text": {"$from": "a", "pointer": "/text"}})),
        ])))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let id = agent.submit_goal(Goal::new("read without waiting")).unwrap();
    let status = agent.wait(&id).await.unwrap();

    assert_eq!(status.state, GoalState::Failed);
    assert!(status.reason.unwrap().contains("without depending"));
    assert!(status.plan.is_none());
    assert_eq!(executed.load(Ordering::SeqCst), 0);
    assert!(agent.audit().events_of(&id, AuditKind::Observation).is_empty());
}

#[tokio::test]
async fn test_modified_action_reaches_tool_and_is_audited_once() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let echo = FnTool::new(ToolSpec::new("echo", "records params"), move |params: Value| {
        sink.lock().unwrap().push(params.clone());
        async move { Ok(params["text"].clone()) }
    });

    let mut cfg = test_config();
    cfg.safety.max_param_chars = 3;
    let agent = AgentCore::builder(cfg)
        .registry(ToolRegistry::new())
        .tool(echo)
        .strategy(Arc::new(Fixed(vec![
            StepSpec::new("say", "echo").params(json!({"text": "hello"})),
        ])))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let id = agent.submit_goal(Goal::new("say hello")).unwrap();
    let status = agent.wait(&id).await.unwrap();
    assert_eq!(status.state, GoalState::Completed, "reason: {:?}", status.reason);

    assert_eq!(*seen.lock().unwrap(), vec![json!({"text": "hel"})]);
    let plan = status.plan.unwrap();
    assert_eq!(plan.by_name("say").unwrap().output, Some(json!("hel")));

    let modified = agent.audit().events_of(&id, AuditKind::ActionModified);
    assert_eq!(modified.len(), 1);
    assert_eq!(modified[0].payload["original"]["params"], json!({"text": "hello"}));
    assert_eq!(modified[0].payload["rewritten"]["params"], json!({"text": "hel"}));
}

fn template_agent(
    policy: FailurePolicy,
    steps: Vec<StepSpec>,
    tools: Vec<FnTool>,
) -> AgentCore {
    let strategy = TemplateStrategy::new(
        vec![PlanTemplate {
            name: "t".into(),
            keywords: vec![],
            steps,
        }],
        policy,
        1,
    );
    let mut builder = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .strategy(Arc::new(strategy))
        .with_tracing_sink(false);
    for tool in tools {
        builder = builder.tool(tool);
    }
    builder.build().unwrap()
}

fn failing_first(name: &str, failures: u32) -> (FnTool, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let tool = FnTool::new(ToolSpec::new(name, "fails at first"), move |params| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < failures {
                Err(ToolError::Permanent("bad response".into()))
            } else {
                Ok(params)
            }
        }
    });
    (tool, calls)
}

#[tokio::test]
async fn test_retry_policy_replans_failed_step_and_keeps_successes() {
    let (flaky, flaky_calls) = failing_first("flaky", 1);
    let (stable, stable_calls) = failing_first("stable", 0);
    let agent = template_agent(
        FailurePolicy::Retry,
        vec![
            StepSpec::new("prepare", "stable"),
            StepSpec::new("risky", "flaky").after("prepare"),
        ],
        vec![flaky, stable],
    );

    let id = agent
        .submit_goal(Goal::new("do it").with_context("template", json!("t")))
        .unwrap();
    let status = agent.wait(&id).await.unwrap();

    assert_eq!(status.state, GoalState::Completed, "reason: {:?}", status.reason);
    let plan = status.plan.unwrap();
    assert_eq!(plan.version, 2);
    assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
    // 已成功的 prepare 沿用，不再执行
    assert_eq!(stable_calls.load(Ordering::SeqCst), 1);
    let states = agent.audit().events_of(&id, AuditKind::GoalState);
    assert!(states.iter().any(|e| e.payload["to"] == json!("replanning")));
}

#[tokio::test]
async fn test_retry_policy_gives_up_after_max_step_retries() {
    let (flaky, calls) = failing_first("flaky", 10);
    let agent = template_agent(
        FailurePolicy::Retry,
        vec![StepSpec::new("risky", "flaky")],
        vec![flaky],
    );

    let id = agent
        .submit_goal(Goal::new("do it").with_context("template", json!("t")))
        .unwrap();
    let status = agent.wait(&id).await.unwrap();

    assert_eq!(status.state, GoalState::Failed);
    assert!(status.reason.unwrap().contains("failed 2 times"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_skip_policy_drops_failed_branch() {
    let (broken, _) = failing_first("broken", 10);
    let agent = template_agent(
        FailurePolicy::Skip,
        vec![
            StepSpec::new("optional", "broken"),
            StepSpec::new("after_optional", "work").after("optional"),
            StepSpec::new("report", "work"),
        ],
        vec![broken, sleeper("work", 5)],
    );

    let id = agent
        .submit_goal(Goal::new("do it").with_context("template", json!("t")))
        .unwrap();
    let status = agent.wait(&id).await.unwrap();

    assert_eq!(status.state, GoalState::Completed, "reason: {:?}", status.reason);
    let plan = status.plan.unwrap();
    assert!(plan.by_name("report").is_some());
    assert!(plan.by_name("optional").is_none());
    assert!(plan.by_name("after_optional").is_none());
}

#[tokio::test]
async fn test_invalidation_reruns_named_step() {
    let (load, load_calls) = failing_first("load", 0);
    let checks = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&checks);
    let check = FnTool::new(ToolSpec::new("check", "invalidates once"), move |_params| {
        let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
        async move {
            if first {
                Ok(json!({"invalidates": ["load"]}))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    });
    let agent = template_agent(
        FailurePolicy::Abort,
        vec![
            StepSpec::new("load", "load"),
            StepSpec::new("check", "check").after("load"),
        ],
        vec![load, check],
    );

    let id = agent
        .submit_goal(Goal::new("load and check").with_context("template", json!("t")))
        .unwrap();
    let status = agent.wait(&id).await.unwrap();

    assert_eq!(status.state, GoalState::Completed, "reason: {:?}", status.reason);
    assert_eq!(load_calls.load(Ordering::SeqCst), 2);
    assert_eq!(checks.load(Ordering::SeqCst), 2);
}

/// 按上下文 n 生成 tail 步骤参数
struct ByContext;

impl PlanStrategy for ByContext {
    fn decompose(&self, goal: &Goal, _memory: &MemoryView) -> Result<Vec<StepSpec>, AgentError> {
        let n = goal.context.get("n").cloned().unwrap_or(json!(1));
        Ok(vec![
            StepSpec::new("slow", "slow"),
            StepSpec::new("tail", "echo").after("slow").params(json!({"n": n})),
        ])
    }
}

#[tokio::test]
async fn test_amend_goal_replans_and_carries_finished_work() {
    let started = Arc::new(Notify::new());
    let runs = Arc::new(AtomicU32::new(0));
    let (signal, counter) = (Arc::clone(&started), Arc::clone(&runs));
    let slow = FnTool::new(ToolSpec::new("slow", "slow step"), move |_params| {
        let signal = Arc::clone(&signal);
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            signal.notify_one();
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("done"))
        }
    });
    let echo = FnTool::new(ToolSpec::new("echo", "echo"), |params| async move { Ok(params) });

    let agent = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .tool(slow)
        .tool(echo)
        .strategy(Arc::new(ByContext))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let id = agent.submit_goal(Goal::new("amend me")).unwrap();
    started.notified().await;
    agent
        .amend_goal(&id, HashMap::from([("n".to_string(), json!(2))]))
        .unwrap();

    let status = agent.wait(&id).await.unwrap();
    assert_eq!(status.state, GoalState::Completed, "reason: {:?}", status.reason);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let plan = status.plan.unwrap();
    assert_eq!(plan.by_name("tail").unwrap().output, Some(json!({"n": 2})));

    let err = agent.amend_goal(&id, HashMap::new()).unwrap_err();
    assert!(matches!(err, AgentError::InvalidPlan(_)));
}

/// 最后一个步骤在返回前修订目标：无论 select! 先处理哪一边，修订都会触发重规划
#[tokio::test]
async fn test_amend_racing_last_step_is_not_dropped() {
    for round in 0..8 {
        let target: Arc<std::sync::OnceLock<(AgentCore, String)>> = Arc::new(std::sync::OnceLock::new());
        let handle = Arc::clone(&target);
        let amended = Arc::new(AtomicU32::new(0));
        let once = Arc::clone(&amended);
        let ping = FnTool::new(ToolSpec::new("ping", "amends its own goal"), move |_params| {
            let handle = Arc::clone(&handle);
            let once = Arc::clone(&once);
            async move {
                if once.fetch_add(1, Ordering::SeqCst) == 0 {
                    if let Some((agent, id)) = handle.get() {
                        agent
                            .amend_goal(id, HashMap::from([("late".to_string(), json!(true))]))
                            .unwrap();
                    }
                }
                Ok(json!("pong"))
            }
        });

        let agent = AgentCore::builder(test_config())
            .registry(ToolRegistry::new())
            .tool(ping)
            .strategy(Arc::new(Fixed(vec![StepSpec::new("only", "ping")])))
            .with_tracing_sink(false)
            .build()
            .unwrap();
        let goal = Goal::new("ping once").with_id(format!("race-{round}"));
        let _ = target.set((agent.clone(), goal.id.clone()));

        let id = agent.submit_goal(goal).unwrap();
        let status = agent.wait(&id).await.unwrap();

        assert_eq!(status.state, GoalState::Completed, "reason: {:?}", status.reason);
        assert_eq!(status.plan.unwrap().version, 2, "round {round}");
        assert_eq!(agent.audit().events_of(&id, AuditKind::PlanInstalled).len(), 2);
        // 沿用已成功的步骤，不重跑
        assert_eq!(amended.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_forget_goal_releases_finished_goal() {
    let agent = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .tool(sleeper("work", 50))
        .strategy(Arc::new(Fixed(vec![StepSpec::new("a", "work")])))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let id = agent.submit_goal(Goal::new("short lived")).unwrap();
    assert!(matches!(agent.forget_goal(&id), Err(AgentError::InvalidPlan(_))));

    agent.wait(&id).await.unwrap();
    let keep = agent.submit_goal(Goal::new("kept")).unwrap();
    agent.wait(&keep).await.unwrap();

    let status = agent.forget_goal(&id).unwrap();
    assert_eq!(status.state, GoalState::Completed);
    assert!(matches!(agent.get_status(&id), Err(AgentError::GoalNotFound(_))));
    assert!(agent.audit().events_for(&id).is_empty());
    assert!(!agent.audit().events_for(&keep).is_empty());
    assert_eq!(agent.goal_ids(), vec![keep]);
    assert!(matches!(agent.forget_goal(&id), Err(AgentError::GoalNotFound(_))));
}

#[tokio::test]
async fn test_unknown_goal_and_duplicate_submission() {
    let agent = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .tool(sleeper("work", 1))
        .strategy(Arc::new(Fixed(vec![StepSpec::new("a", "work")])))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    assert!(matches!(
        agent.get_status("missing"),
        Err(AgentError::GoalNotFound(_))
    ));
    assert!(matches!(
        agent.cancel_goal("missing"),
        Err(AgentError::GoalNotFound(_))
    ));

    let id = agent.submit_goal(Goal::new("once").with_id("fixed")).unwrap();
    assert!(matches!(
        agent.submit_goal(Goal::new("twice").with_id("fixed")),
        Err(AgentError::InvalidPlan(_))
    ));
    assert_eq!(agent.wait(&id).await.unwrap().state, GoalState::Completed);
}

#[tokio::test]
async fn test_shutdown_rejects_new_goals() {
    let agent = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .tool(sleeper("work", 1))
        .strategy(Arc::new(Fixed(vec![StepSpec::new("a", "work")])))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    agent.shutdown();
    assert!(matches!(
        agent.submit_goal(Goal::new("too late")),
        Err(AgentError::Cancelled)
    ));
}

#[tokio::test]
async fn test_completed_goal_is_recalled_when_planning_later() {
    let agent = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .tool(sleeper("work", 1))
        .strategy(Arc::new(Fixed(vec![StepSpec::new("a", "work")])))
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let memory = agent.memory();
    memory.put(
        MemoryTier::LongTerm,
        MemoryEntry::new(MemoryTier::LongTerm, "pref/lang", Value::String("rust".into())),
    );
    let id = agent.submit_goal(Goal::new("anything")).unwrap();
    agent.wait(&id).await.unwrap();

    let view = memory.view("another", 8);
    assert_eq!(view.lookup("pref/lang"), Some(&json!("rust")));
    assert!(view.lookup(&format!("goal/{id}")).is_some());
}

#[test]
fn test_default_config_file_parses() {
    let cfg = load_config_file("config/default.toml").unwrap();
    assert_eq!(cfg.planner.on_failure, FailurePolicy::Retry);
    assert_eq!(cfg.planner.templates.len(), 2);
    assert_eq!(cfg.planner.templates[0].steps[1].depends_on, vec!["fetch".to_string()]);
    assert_eq!(cfg.safety.max_calls_per_action, Some(20));
}

#[tokio::test]
async fn test_goal_drain_cancels_running_goals_before_flush() {
    use agnes::core::{GoalDrain, MemoryFlush, ShutdownCoordinator, ShutdownManager};

    let shutdown = Arc::new(ShutdownManager::new());
    let agent = AgentCore::builder(test_config())
        .registry(ToolRegistry::new())
        .tool(sleeper("work", 5_000))
        .strategy(Arc::new(Fixed(vec![StepSpec::new("a", "work")])))
        .root_token(shutdown.token())
        .with_tracing_sink(false)
        .build()
        .unwrap();

    let id = agent.submit_goal(Goal::new("long running")).unwrap();
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(GoalDrain::new(agent.clone()));
    coordinator.register(MemoryFlush::new(agent.memory()));

    let report = coordinator.run_cleanup().await;
    assert_eq!(report.succeeded, vec!["goal_drain".to_string(), "memory_flush".to_string()]);
    assert!(shutdown.is_shutdown());
    assert_eq!(agent.get_status(&id).unwrap().state, GoalState::Cancelled);
}
