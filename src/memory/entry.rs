//! 记忆条目：层级、键值、时间戳、显著度、可选 TTL

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::GoalId;

/// 记忆层级：Working 随目标清空，Episodic 随会话，LongTerm 跨会话
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Working,
    Episodic,
    LongTerm,
}

impl MemoryTier {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryTier::Working => "working",
            MemoryTier::Episodic => "episodic",
            MemoryTier::LongTerm => "long_term",
        }
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub tier: MemoryTier,
    pub key: String,
    pub value: Value,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub salience: f64,
    #[serde(default)]
    pub ttl_ms: Option<i64>,
    /// 写入该条目的目标（Working 层按目标清理）
    #[serde(default)]
    pub goal_id: Option<GoalId>,
}

impl MemoryEntry {
    pub fn new(tier: MemoryTier, key: impl Into<String>, value: Value) -> Self {
        Self {
            tier,
            key: key.into(),
            value,
            timestamp: chrono::Utc::now().timestamp_millis(),
            salience: 0.5,
            ttl_ms: None,
            goal_id: None,
        }
    }

    pub fn with_salience(mut self, salience: f64) -> Self {
        self.salience = if salience.is_nan() { 0.0 } else { salience };
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn for_goal(mut self, goal_id: impl Into<GoalId>) -> Self {
        self.goal_id = Some(goal_id.into());
        self
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.ttl_ms
            .is_some_and(|ttl| self.timestamp.saturating_add(ttl) <= now_ms)
    }
}

/// query 过滤条件
#[derive(Debug, Clone, Default)]
pub struct SalienceFilter {
    pub min_salience: Option<f64>,
    pub goal_id: Option<GoalId>,
    pub key_prefix: Option<String>,
}

impl SalienceFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn min(salience: f64) -> Self {
        Self {
            min_salience: Some(salience),
            ..Self::default()
        }
    }

    pub fn goal(mut self, goal_id: impl Into<GoalId>) -> Self {
        self.goal_id = Some(goal_id.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        self.min_salience.map_or(true, |min| entry.salience >= min)
            && self
                .goal_id
                .as_ref()
                .map_or(true, |g| entry.goal_id.as_ref() == Some(g))
            && self
                .key_prefix
                .as_ref()
                .map_or(true, |p| entry.key.starts_with(p.as_str()))
    }
}
