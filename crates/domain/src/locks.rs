use std::time::Duration;

use async_trait::async_trait;

use orchestrator_errors::OrchestratorResult;

use crate::item::ItemId;

/// 按条目ID加锁的互斥存储
#[async_trait]
pub trait LockStore: Send + Sync {
    /// 非阻塞：已被其他持有者占用时立即返回 `false`
    async fn try_acquire(&self, key: ItemId, owner: &str, ttl: Duration)
        -> OrchestratorResult<bool>;

    /// 只释放自己持有的锁
    async fn release(&self, key: ItemId, owner: &str) -> OrchestratorResult<bool>;

    async fn holder(&self, key: ItemId) -> OrchestratorResult<Option<String>>;
}
