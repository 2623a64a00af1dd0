//! 记忆持久化边界
//!
//! MemoryManager 只通过 MemoryBackend 的 load / save 读写 Episodic 与 LongTerm 层，不关心存储引擎。
//! 自带 NoopBackend（不落盘）与 JsonFileBackend（每层一个 JSON 文件）。

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::memory::{MemoryEntry, MemoryTier};

/// 外部存储：按层整体加载 / 保存
pub trait MemoryBackend: Send + Sync {
    fn load(&self, tier: MemoryTier) -> anyhow::Result<Vec<MemoryEntry>>;

    fn save(&self, tier: MemoryTier, entries: &[MemoryEntry]) -> anyhow::Result<()>;
}

/// 未配置持久化目录时使用
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

impl MemoryBackend for NoopBackend {
    fn load(&self, _tier: MemoryTier) -> anyhow::Result<Vec<MemoryEntry>> {
        Ok(Vec::new())
    }

    fn save(&self, _tier: MemoryTier, _entries: &[MemoryEntry]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 简单的文件持久化：<dir>/<tier>.json
#[derive(Debug)]
pub struct JsonFileBackend {
    dir: PathBuf,
}

impl JsonFileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, tier: MemoryTier) -> PathBuf {
        self.dir.join(format!("{}.json", tier.as_str()))
    }
}

impl MemoryBackend for JsonFileBackend {
    /// 文件不存在时返回空 Vec
    fn load(&self, tier: MemoryTier) -> anyhow::Result<Vec<MemoryEntry>> {
        let path = self.path(tier);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let entries: Vec<MemoryEntry> = serde_json::from_str(&data)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(entries)
    }

    /// 父目录不存在时自动创建；先写临时文件再 rename，避免半截文件
    fn save(&self, tier: MemoryTier, entries: &[MemoryEntry]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;
        let path = self.path(tier);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(entries)?)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }
}
