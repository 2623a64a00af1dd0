//! 审计日志：有序、只追加
//!
//! 每次目标状态迁移、步骤状态变更、Observation、安全裁决都会生成一条 AuditEvent，
//! 先写入内存日志（可查询），再按同一顺序分发给外部 AuditSink（日志 / 指标 / 链路采集）。

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use crate::core::GoalId;
use crate::plan::StepId;

/// 事件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// 目标状态迁移
    GoalState,
    /// 新版本计划生效
    PlanInstalled,
    /// 步骤状态变更
    StepStatus,
    /// 单次工具调用尝试的结果
    Observation,
    /// 目标已取消后才返回的调用结果（只记录，不应用）
    LateObservation,
    /// 单条安全规则的裁决
    SafetyVerdict,
    /// 安全闸门改写了动作参数
    ActionModified,
}

/// 对外事件结构：kind / timestamp / goal / step / payload
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// 全局递增序号，决定事件顺序
    pub seq: u64,
    pub kind: AuditKind,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub goal_id: GoalId,
    pub step_id: Option<StepId>,
    pub payload: Value,
}

/// 外部观测边界：日志、指标、链路追踪的采集端实现此 trait
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// 将事件以结构化 JSON 写入 tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn emit(&self, event: &AuditEvent) {
        let audit = serde_json::to_string(event).unwrap_or_default();
        tracing::info!(
            audit = %audit,
            goal = %event.goal_id,
            kind = ?event.kind,
            "audit"
        );
    }
}

#[derive(Default)]
struct AuditInner {
    next_seq: u64,
    events: Vec<AuditEvent>,
}

/// 内存审计日志 + 外部 sink 分发
#[derive(Default)]
pub struct AuditLog {
    inner: Mutex<AuditInner>,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// 追加一条事件；持锁分发，保证所有 sink 看到与日志一致的顺序
    pub fn record(
        &self,
        kind: AuditKind,
        goal_id: &str,
        step_id: Option<StepId>,
        payload: Value,
    ) -> AuditEvent {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let event = AuditEvent {
            seq: inner.next_seq,
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            goal_id: goal_id.to_string(),
            step_id,
            payload,
        };
        inner.next_seq += 1;
        for sink in &self.sinks {
            sink.emit(&event);
        }
        inner.events.push(event.clone());
        event
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .clone()
    }

    pub fn events_for(&self, goal_id: &str) -> Vec<AuditEvent> {
        self.filter(|e| e.goal_id == goal_id)
    }

    pub fn events_of(&self, goal_id: &str, kind: AuditKind) -> Vec<AuditEvent> {
        self.filter(|e| e.goal_id == goal_id && e.kind == kind)
    }

    /// 移除某个目标的全部事件，返回移除条数；序号不回收
    pub fn forget(&self, goal_id: &str) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.events.len();
        inner.events.retain(|e| e.goal_id != goal_id);
        before - inner.events.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn filter(&self, pred: impl Fn(&AuditEvent) -> bool) -> Vec<AuditEvent> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink(std::sync::atomic::AtomicUsize);

    impl AuditSink for CountingSink {
        fn emit(&self, _event: &AuditEvent) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_record_is_ordered_and_forwarded() {
        let sink = Arc::new(CountingSink(std::sync::atomic::AtomicUsize::new(0)));
        let log = AuditLog::new().with_sink(sink.clone());
        log.record(AuditKind::GoalState, "g1", None, serde_json::json!({"to": "planning"}));
        log.record(AuditKind::StepStatus, "g1", Some(StepId(1)), serde_json::json!({}));
        log.record(AuditKind::GoalState, "g2", None, serde_json::json!({}));

        let events = log.events();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(sink.0.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(log.events_for("g1").len(), 2);
        assert_eq!(log.events_of("g1", AuditKind::StepStatus).len(), 1);
    }

    #[test]
    fn test_forget_drops_one_goal_and_keeps_sequence() {
        let log = AuditLog::new();
        log.record(AuditKind::GoalState, "g1", None, serde_json::json!({}));
        log.record(AuditKind::GoalState, "g2", None, serde_json::json!({}));
        log.record(AuditKind::StepStatus, "g1", Some(StepId(1)), serde_json::json!({}));

        assert_eq!(log.forget("g1"), 2);
        assert_eq!(log.forget("g1"), 0);
        assert_eq!(log.len(), 1);
        let next = log.record(AuditKind::GoalState, "g3", None, serde_json::json!({}));
        assert_eq!(next.seq, 3);
    }
}
