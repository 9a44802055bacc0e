//! 持久化抽象
//!
//! 核心把持久化视为按条目ID寻址的事务性键值存储，内部实现不透明。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use orchestrator_errors::OrchestratorResult;

use crate::item::{ItemId, MediaItem};

/// 条目的亲属关系：祖先（由近及远）与全部后代
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemRelations {
    pub ancestors: Vec<ItemId>,
    pub descendants: Vec<ItemId>,
}

impl ItemRelations {
    /// 自身加上所有祖先和后代
    pub fn closure(&self, id: ItemId) -> Vec<ItemId> {
        let mut ids = Vec::with_capacity(1 + self.ancestors.len() + self.descendants.len());
        ids.push(id);
        ids.extend(&self.ancestors);
        ids.extend(&self.descendants);
        ids
    }
}

#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn get(&self, id: ItemId) -> OrchestratorResult<Option<MediaItem>>;

    /// 插入或替换；子节点写入其所在的根树
    async fn upsert(&self, item: &MediaItem) -> OrchestratorResult<()>;

    /// 未知ID返回空关系
    async fn relations(&self, id: ItemId) -> OrchestratorResult<ItemRelations>;

    /// 仍有工作要做的根条目ID（Movie/Show）
    async fn incomplete_ids(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<ItemId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_includes_self_first() {
        let relations = ItemRelations {
            ancestors: vec![10, 1],
            descendants: vec![],
        };
        assert_eq!(relations.closure(100), vec![100, 10, 1]);
    }
}
