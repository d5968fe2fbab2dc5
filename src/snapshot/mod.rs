/// 快照系统 (Snapshot System)
///
/// - Cache: 目标截图保留集 + 场景图缓存, 随窗口事件释放
/// - Store: 最佳截图持久化
pub mod cache;
pub mod store;

pub use cache::{Score, Snapshot, SnapshotCache, SnapshotConfig};
pub use store::{ArtifactStore, DirectoryStore, MemoryStore};
