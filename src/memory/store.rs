//! 单层记忆存储：有界键值表 + 按显著度排序的淘汰索引
//!
//! 三个层级共用同一类型，差别只在容量配置。淘汰顺序：显著度最低 → 时间戳最旧 → 写入最早，
//! 超容量时在 put 内同步淘汰，不做后台清扫。

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use crate::memory::entry::{MemoryEntry, MemoryTier, SalienceFilter};

/// f64 全序包装（total_cmp）
#[derive(Debug, Clone, Copy)]
struct Salience(f64);

impl PartialEq for Salience {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Salience {}

impl PartialOrd for Salience {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Salience {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// 淘汰索引键：字段顺序即比较顺序
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EvictionKey {
    salience: Salience,
    timestamp: i64,
    seq: u64,
    key: String,
}

#[derive(Debug, Clone)]
struct Stored {
    entry: MemoryEntry,
    /// 写入序号；同键覆盖时刷新
    seq: u64,
}

impl Stored {
    fn eviction_key(&self) -> EvictionKey {
        EvictionKey {
            salience: Salience(self.entry.salience),
            timestamp: self.entry.timestamp,
            seq: self.seq,
            key: self.entry.key.clone(),
        }
    }
}

#[derive(Debug)]
pub struct TierStore {
    tier: MemoryTier,
    /// None 表示无上限（Working 层）
    capacity: Option<usize>,
    entries: HashMap<String, Stored>,
    index: BTreeSet<EvictionKey>,
    next_seq: u64,
}

impl TierStore {
    pub fn new(tier: MemoryTier, capacity: Option<usize>) -> Self {
        Self {
            tier,
            capacity,
            entries: HashMap::new(),
            index: BTreeSet::new(),
            next_seq: 0,
        }
    }

    pub fn tier(&self) -> MemoryTier {
        self.tier
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 写入（同键覆盖）；返回因超容量或过期被移除的条目
    pub fn put(&mut self, mut entry: MemoryEntry, now_ms: i64) -> Vec<MemoryEntry> {
        let mut removed = self.purge_expired(now_ms);
        entry.tier = self.tier;

        if let Some(old) = self.entries.remove(&entry.key) {
            self.index.remove(&old.eviction_key());
        }
        let stored = Stored {
            entry,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.index.insert(stored.eviction_key());
        self.entries.insert(stored.entry.key.clone(), stored);

        while self.capacity.is_some_and(|cap| self.entries.len() > cap) {
            let Some(victim) = self.index.pop_first() else {
                break;
            };
            if let Some(stored) = self.entries.remove(&victim.key) {
                removed.push(stored.entry);
            }
        }
        removed
    }

    pub fn get(&self, key: &str, now_ms: i64) -> Option<&MemoryEntry> {
        self.entries
            .get(key)
            .map(|s| &s.entry)
            .filter(|e| !e.is_expired(now_ms))
    }

    pub fn remove(&mut self, key: &str) -> Option<MemoryEntry> {
        let stored = self.entries.remove(key)?;
        self.index.remove(&stored.eviction_key());
        Some(stored.entry)
    }

    /// 显著度降序，同分时最近写入者优先
    pub fn query(&self, filter: &SalienceFilter, limit: usize, now_ms: i64) -> Vec<MemoryEntry> {
        self.index
            .iter()
            .rev()
            .filter_map(|k| self.entries.get(&k.key))
            .map(|s| &s.entry)
            .filter(|e| !e.is_expired(now_ms) && filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// 删除不满足 keep 的条目，返回删除数量
    pub fn retain(&mut self, keep: impl Fn(&MemoryEntry) -> bool) -> usize {
        let doomed: Vec<String> = self
            .entries
            .values()
            .filter(|s| !keep(&s.entry))
            .map(|s| s.entry.key.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// 按写入顺序导出全部未过期条目（持久化用）
    pub fn snapshot(&self, now_ms: i64) -> Vec<MemoryEntry> {
        let mut stored: Vec<&Stored> = self
            .entries
            .values()
            .filter(|s| !s.entry.is_expired(now_ms))
            .collect();
        stored.sort_by_key(|s| s.seq);
        stored.into_iter().map(|s| s.entry.clone()).collect()
    }

    fn purge_expired(&mut self, now_ms: i64) -> Vec<MemoryEntry> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|s| s.entry.is_expired(now_ms))
            .map(|s| s.entry.key.clone())
            .collect();
        expired.iter().filter_map(|k| self.remove(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, salience: f64, timestamp: i64) -> MemoryEntry {
        MemoryEntry::new(MemoryTier::Episodic, key, json!(key))
            .with_salience(salience)
            .with_timestamp(timestamp)
    }

    #[test]
    fn test_eviction_scripted_sequence() {
        let mut store = TierStore::new(MemoryTier::Episodic, Some(3));
        assert!(store.put(entry("a", 0.5, 10), 100).is_empty());
        assert!(store.put(entry("b", 0.2, 20), 100).is_empty());
        assert!(store.put(entry("c", 0.9, 30), 100).is_empty());

        // 超容量：b 的显著度最低
        let evicted = store.put(entry("d", 0.6, 40), 100);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "b");

        // 同分 0.5：a 更旧，先被淘汰
        let evicted = store.put(entry("e", 0.5, 50), 100);
        assert_eq!(evicted[0].key, "a");

        // 新条目自身最低时淘汰自身
        let evicted = store.put(entry("f", 0.1, 60), 100);
        assert_eq!(evicted[0].key, "f");

        let mut keys: Vec<String> = store.snapshot(100).into_iter().map(|e| e.key).collect();
        keys.sort();
        assert_eq!(keys, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_same_timestamp_tie_broken_by_write_order() {
        let mut store = TierStore::new(MemoryTier::LongTerm, Some(2));
        store.put(entry("x", 0.3, 5), 100);
        store.put(entry("y", 0.3, 5), 100);
        let evicted = store.put(entry("z", 0.8, 5), 100);
        assert_eq!(evicted[0].key, "x");
    }

    #[test]
    fn test_overwrite_replaces_index_entry() {
        let mut store = TierStore::new(MemoryTier::Episodic, Some(2));
        store.put(entry("a", 0.1, 1), 100);
        store.put(entry("b", 0.5, 2), 100);
        // a 被覆盖为高显著度后不再是淘汰对象
        store.put(entry("a", 0.9, 3), 100);
        assert_eq!(store.len(), 2);
        let evicted = store.put(entry("c", 0.7, 4), 100);
        assert_eq!(evicted[0].key, "b");
        assert_eq!(store.get("a", 100).unwrap().salience, 0.9);
    }

    #[test]
    fn test_query_orders_by_salience_then_recency() {
        let mut store = TierStore::new(MemoryTier::Episodic, None);
        store.put(entry("old", 0.5, 1), 100);
        store.put(entry("top", 0.9, 2), 100);
        store.put(entry("new", 0.5, 3), 100);
        store.put(entry("low", 0.1, 4), 100);

        let keys: Vec<String> = store
            .query(&SalienceFilter::any(), 10, 100)
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["top", "new", "old", "low"]);

        let keys: Vec<String> = store
            .query(&SalienceFilter::min(0.4), 2, 100)
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["top", "new"]);
    }

    #[test]
    fn test_ttl_hides_and_purges() {
        let mut store = TierStore::new(MemoryTier::Working, None);
        store.put(entry("short", 0.5, 0).with_ttl_ms(10), 0);
        assert!(store.get("short", 5).is_some());
        assert!(store.get("short", 10).is_none());
        assert!(store.query(&SalienceFilter::any(), 10, 20).is_empty());

        let removed = store.put(entry("other", 0.5, 20), 20);
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 1);
    }
}
