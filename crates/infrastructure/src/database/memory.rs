use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use orchestrator_domain::{is_incomplete, ItemId, ItemRelations, ItemRepository, MediaItem};
use orchestrator_errors::OrchestratorResult;

use super::{lookup_keys, merge_into_root, relations_in, tree_ids};

#[derive(Default)]
struct Trees {
    roots: HashMap<ItemId, MediaItem>,
    /// 条目ID -> 根条目ID
    index: HashMap<ItemId, ItemId>,
}

/// 内存条目仓储，用于测试和单机运行
#[derive(Default)]
pub struct InMemoryItemRepository {
    trees: RwLock<Trees>,
}

impl InMemoryItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.trees.read().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.trees.read().await.index.is_empty()
    }
}

#[async_trait]
impl ItemRepository for InMemoryItemRepository {
    async fn get(&self, id: ItemId) -> OrchestratorResult<Option<MediaItem>> {
        let trees = self.trees.read().await;
        Ok(trees
            .index
            .get(&id)
            .and_then(|root_id| trees.roots.get(root_id))
            .and_then(|root| root.find(id)))
    }

    async fn upsert(&self, item: &MediaItem) -> OrchestratorResult<()> {
        let mut trees = self.trees.write().await;
        let root_id = lookup_keys(item)
            .into_iter()
            .find_map(|key| trees.index.get(&key).copied());
        let existing = root_id.and_then(|id| trees.roots.get(&id).cloned());
        let root = merge_into_root(existing, item)?;

        let new_root_id = root.id();
        trees.index.retain(|_, r| *r != new_root_id);
        for id in tree_ids(&root) {
            trees.index.insert(id, new_root_id);
        }
        trees.roots.insert(new_root_id, root);
        debug!("条目已写入内存仓储: {}", item.log_string());
        Ok(())
    }

    async fn relations(&self, id: ItemId) -> OrchestratorResult<ItemRelations> {
        let trees = self.trees.read().await;
        Ok(trees
            .index
            .get(&id)
            .and_then(|root_id| trees.roots.get(root_id))
            .map(|root| relations_in(root, id))
            .unwrap_or_default())
    }

    async fn incomplete_ids(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<ItemId>> {
        let trees = self.trees.read().await;
        let mut ids: Vec<ItemId> = trees
            .roots
            .values()
            .filter(|root| is_incomplete(root, now))
            .map(MediaItem::id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
