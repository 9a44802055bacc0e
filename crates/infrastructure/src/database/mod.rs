pub mod memory;
pub mod sqlite;

pub use memory::InMemoryItemRepository;
pub use sqlite::SqliteItemRepository;

use orchestrator_domain::{ItemId, ItemRelations, MediaItem};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

/// 把条目合并进它所属的根树，返回合并后的根。
/// 没有根时只有 Movie/Show 可以自成一棵新树。
pub(crate) fn merge_into_root(
    root: Option<MediaItem>,
    item: &MediaItem,
) -> OrchestratorResult<MediaItem> {
    item.validate()?;
    let mut root = match root {
        Some(root) => root,
        None => match item.parent_id() {
            None => return Ok(item.clone()),
            Some(parent_id) => {
                return Err(OrchestratorError::InvalidHierarchy(format!(
                    "条目 {} 的父节点 {} 不存在",
                    item.id(),
                    parent_id
                )))
            }
        },
    };
    if !root.upsert_node(item.clone())? {
        return Err(OrchestratorError::InvalidHierarchy(format!(
            "条目 {} 不属于根条目 {}",
            item.id(),
            root.id()
        )));
    }
    root.validate()?;
    Ok(root)
}

/// 写入时定位根树用的候选ID：先找自己，再找父节点
pub(crate) fn lookup_keys(item: &MediaItem) -> Vec<ItemId> {
    let mut keys = vec![item.id()];
    keys.extend(item.parent_id());
    keys
}

pub(crate) fn relations_in(root: &MediaItem, id: ItemId) -> ItemRelations {
    ItemRelations {
        ancestors: root.ancestors_of(id),
        descendants: root
            .find(id)
            .map(|node| node.descendant_ids())
            .unwrap_or_default(),
    }
}

pub(crate) fn tree_ids(root: &MediaItem) -> Vec<ItemId> {
    let mut ids = vec![root.id()];
    ids.extend(root.descendant_ids());
    ids
}
