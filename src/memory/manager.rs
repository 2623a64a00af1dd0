//! 分层记忆管理：Working / Episodic / LongTerm
//!
//! 三层各持一把锁，所有目标共享同一实例；同层写入全序串行，同键以最后提交者为准。
//! Episodic / LongTerm 通过 MemoryBackend 加载与落盘；显著度评分由 SaliencePolicy 决定。

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::config::MemorySection;
use crate::core::AgentError;
use crate::memory::{
    MemoryBackend, MemoryEntry, MemoryTier, NoopBackend, SalienceFilter, TierStore,
};
use crate::tools::Observation;

/// 显著度评分策略（公式可替换，不写死）
pub trait SaliencePolicy: Send + Sync {
    fn score(&self, observation: &Observation) -> f64;
}

/// 默认策略：基础分 + 成功加成，截断到 [0, 1]
#[derive(Debug, Clone, Copy)]
pub struct ConfiguredSalience {
    pub base: f64,
    pub success_boost: f64,
}

impl SaliencePolicy for ConfiguredSalience {
    fn score(&self, observation: &Observation) -> f64 {
        let boost = if observation.success {
            self.success_boost
        } else {
            0.0
        };
        (self.base + boost).clamp(0.0, 1.0)
    }
}

/// 规划器读取的记忆快照：本目标的 Working 条目 + 按显著度召回的 Episodic / LongTerm 条目
#[derive(Debug, Clone, Default)]
pub struct MemoryView {
    pub working: Vec<MemoryEntry>,
    pub recalled: Vec<MemoryEntry>,
}

impl MemoryView {
    /// 先查 Working，再查召回集合
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.working
            .iter()
            .chain(self.recalled.iter())
            .find(|e| e.key == key)
            .map(|e| &e.value)
    }
}

pub struct MemoryManager {
    working: RwLock<TierStore>,
    episodic: RwLock<TierStore>,
    long_term: RwLock<TierStore>,
    backend: Arc<dyn MemoryBackend>,
    salience: Arc<dyn SaliencePolicy>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl MemoryManager {
    pub fn new(
        episodic_capacity: usize,
        long_term_capacity: usize,
        backend: Arc<dyn MemoryBackend>,
        salience: Arc<dyn SaliencePolicy>,
    ) -> Self {
        Self {
            working: RwLock::new(TierStore::new(MemoryTier::Working, None)),
            episodic: RwLock::new(TierStore::new(MemoryTier::Episodic, Some(episodic_capacity))),
            long_term: RwLock::new(TierStore::new(MemoryTier::LongTerm, Some(long_term_capacity))),
            backend,
            salience,
        }
    }

    /// 从配置创建；persistence_dir 未设置时不落盘
    pub fn from_config(cfg: &MemorySection) -> Self {
        let backend: Arc<dyn MemoryBackend> = match &cfg.persistence_dir {
            Some(dir) => Arc::new(crate::memory::JsonFileBackend::new(dir)),
            None => Arc::new(NoopBackend),
        };
        Self::new(
            cfg.episodic_capacity,
            cfg.long_term_capacity,
            backend,
            Arc::new(ConfiguredSalience {
                base: cfg.base_salience,
                success_boost: cfg.success_boost,
            }),
        )
    }

    fn read(&self, tier: MemoryTier) -> RwLockReadGuard<'_, TierStore> {
        let lock = match tier {
            MemoryTier::Working => &self.working,
            MemoryTier::Episodic => &self.episodic,
            MemoryTier::LongTerm => &self.long_term,
        };
        lock.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, tier: MemoryTier) -> RwLockWriteGuard<'_, TierStore> {
        let lock = match tier {
            MemoryTier::Working => &self.working,
            MemoryTier::Episodic => &self.episodic,
            MemoryTier::LongTerm => &self.long_term,
        };
        lock.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, tier: MemoryTier, key: &str) -> Option<MemoryEntry> {
        self.read(tier).get(key, now_ms()).cloned()
    }

    /// 写入；超容量时同步淘汰，不向调用方报错
    pub fn put(&self, tier: MemoryTier, entry: MemoryEntry) {
        let key = entry.key.clone();
        let removed = self.write(tier).put(entry, now_ms());
        if !removed.is_empty() {
            let over = AgentError::MemoryCapacity(tier.to_string());
            tracing::debug!(
                tier = %tier,
                key = %key,
                removed = removed.len(),
                "{over}, evicted lowest-salience entries"
            );
        }
    }

    pub fn query(&self, tier: MemoryTier, filter: &SalienceFilter, limit: usize) -> Vec<MemoryEntry> {
        self.read(tier).query(filter, limit, now_ms())
    }

    pub fn remove(&self, tier: MemoryTier, key: &str) -> Option<MemoryEntry> {
        self.write(tier).remove(key)
    }

    pub fn len(&self, tier: MemoryTier) -> usize {
        self.read(tier).len()
    }

    /// 目标结束时清理其 Working 条目
    pub fn clear_working(&self, goal_id: &str) -> usize {
        self.write(MemoryTier::Working)
            .retain(|e| e.goal_id.as_deref() != Some(goal_id))
    }

    /// 规划上下文：Working 全量 + Episodic / LongTerm 中最显著的 budget 条
    pub fn view(&self, goal_id: &str, budget: usize) -> MemoryView {
        let working = self.query(
            MemoryTier::Working,
            &SalienceFilter::any().goal(goal_id),
            usize::MAX,
        );
        let mut recalled = self.query(MemoryTier::Episodic, &SalienceFilter::any(), budget);
        recalled.extend(self.query(MemoryTier::LongTerm, &SalienceFilter::any(), budget));
        recalled.sort_by(|a, b| {
            b.salience
                .total_cmp(&a.salience)
                .then(b.timestamp.cmp(&a.timestamp))
        });
        recalled.truncate(budget);
        MemoryView { working, recalled }
    }

    pub fn salience_for(&self, observation: &Observation) -> f64 {
        self.salience.score(observation)
    }

    /// 启动时从外部存储加载 Episodic 与 LongTerm
    pub fn restore(&self) -> Result<usize, AgentError> {
        let mut loaded = 0;
        for tier in [MemoryTier::Episodic, MemoryTier::LongTerm] {
            let entries = self
                .backend
                .load(tier)
                .map_err(|e| AgentError::Persistence(format!("{e:#}")))?;
            let mut store = self.write(tier);
            let now = now_ms();
            for entry in entries {
                store.put(entry, now);
                loaded += 1;
            }
        }
        tracing::info!(loaded, "memory restored");
        Ok(loaded)
    }

    /// 将 Episodic 与 LongTerm 写回外部存储
    pub fn flush(&self) -> Result<(), AgentError> {
        for tier in [MemoryTier::Episodic, MemoryTier::LongTerm] {
            let snapshot = self.read(tier).snapshot(now_ms());
            self.backend
                .save(tier, &snapshot)
                .map_err(|e| AgentError::Persistence(format!("{e:#}")))?;
        }
        Ok(())
    }

    /// 会话结束：Episodic 清空
    pub fn end_session(&self) {
        self.write(MemoryTier::Episodic).clear();
    }
}
