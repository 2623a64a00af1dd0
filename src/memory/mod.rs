//! 记忆层：Working（单目标）、Episodic（会话）、LongTerm（跨会话）与持久化边界

pub mod entry;
pub mod manager;
pub mod persistence;
pub mod store;

pub use entry::{MemoryEntry, MemoryTier, SalienceFilter};
pub use manager::{ConfiguredSalience, MemoryManager, MemoryView, SaliencePolicy};
pub use persistence::{JsonFileBackend, MemoryBackend, NoopBackend};
pub use store::TierStore;
