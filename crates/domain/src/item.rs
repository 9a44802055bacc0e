//! 媒体条目层级模型
//!
//! Show 拥有 Season，Season 拥有 Episode，树自顶向下持有，因此天然无环。
//! Season/Episode 通过 `parent_id` 只读地回指父节点。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orchestrator_errors::{OrchestratorError, OrchestratorResult};

pub type ItemId = i64;

/// 外部元数据ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    pub imdb_id: Option<String>,
    pub tvdb_id: Option<String>,
    pub tmdb_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamAvailability {
    Unchecked,
    Cached,
    Uncached,
}

/// 候选资源（例如种子）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub infohash: String,
    pub raw_title: String,
    pub rank: i64,
    pub availability: StreamAvailability,
}

impl Stream {
    pub fn new(infohash: impl Into<String>, raw_title: impl Into<String>) -> Self {
        Self {
            infohash: infohash.into(),
            raw_title: raw_title.into(),
            rank: 0,
            availability: StreamAvailability::Unchecked,
        }
    }

    pub fn cached(mut self) -> Self {
        self.availability = StreamAvailability::Cached;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.availability = StreamAvailability::Uncached;
        self
    }

    pub fn is_checked(&self) -> bool {
        self.availability != StreamAvailability::Unchecked
    }
}

/// 叶子条目（Movie/Episode）的事实字段，状态完全由这些字段推导
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemFacts {
    pub id: ItemId,
    pub title: Option<String>,
    pub aired_at: Option<DateTime<Utc>>,
    pub requested_by: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
    pub indexed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_ids: ExternalIds,
    #[serde(default)]
    pub streams: Vec<Stream>,
    pub file: Option<String>,
    pub folder: Option<String>,
    #[serde(default)]
    pub symlinked: bool,
    /// 放置标记，一旦设置就不能清除
    #[serde(default)]
    placed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub post_processed: bool,
}

impl ItemFacts {
    pub fn new(id: ItemId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn placed_at(&self) -> Option<DateTime<Utc>> {
        self.placed_at
    }

    pub fn is_placed(&self) -> bool {
        self.placed_at.is_some()
    }

    /// 设置放置标记；已设置时保留最早的时间戳
    pub fn mark_placed(&mut self, at: DateTime<Utc>) {
        if self.placed_at.is_none() {
            self.placed_at = Some(at);
        }
    }

    pub fn is_scraped(&self) -> bool {
        !self.streams.is_empty()
    }

    pub fn is_checked_for_availability(&self) -> bool {
        self.streams.iter().all(Stream::is_checked)
    }

    pub fn has_cached_stream(&self) -> bool {
        self.streams
            .iter()
            .any(|s| s.availability == StreamAvailability::Cached)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub facts: ItemFacts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub parent_id: ItemId,
    pub number: u32,
    pub facts: ItemFacts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Season {
    pub id: ItemId,
    pub parent_id: ItemId,
    pub number: u32,
    pub aired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Show {
    pub id: ItemId,
    pub title: Option<String>,
    #[serde(default)]
    pub external_ids: ExternalIds,
    pub aired_at: Option<DateTime<Utc>>,
    pub requested_by: Option<String>,
    pub indexed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seasons: Vec<Season>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaItem {
    Movie(Movie),
    Show(Show),
    Season(Season),
    Episode(Episode),
}

impl MediaItem {
    pub fn id(&self) -> ItemId {
        match self {
            MediaItem::Movie(m) => m.facts.id,
            MediaItem::Show(s) => s.id,
            MediaItem::Season(s) => s.id,
            MediaItem::Episode(e) => e.facts.id,
        }
    }

    pub fn parent_id(&self) -> Option<ItemId> {
        match self {
            MediaItem::Movie(_) | MediaItem::Show(_) => None,
            MediaItem::Season(s) => Some(s.parent_id),
            MediaItem::Episode(e) => Some(e.parent_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MediaItem::Movie(_) => "movie",
            MediaItem::Show(_) => "show",
            MediaItem::Season(_) => "season",
            MediaItem::Episode(_) => "episode",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, MediaItem::Movie(_) | MediaItem::Episode(_))
    }

    pub fn facts(&self) -> Option<&ItemFacts> {
        match self {
            MediaItem::Movie(m) => Some(&m.facts),
            MediaItem::Episode(e) => Some(&e.facts),
            _ => None,
        }
    }

    pub fn facts_mut(&mut self) -> Option<&mut ItemFacts> {
        match self {
            MediaItem::Movie(m) => Some(&mut m.facts),
            MediaItem::Episode(e) => Some(&mut e.facts),
            _ => None,
        }
    }

    /// 用于日志的可读描述
    pub fn log_string(&self) -> String {
        match self {
            MediaItem::Movie(m) => format!(
                "movie {} ({})",
                m.facts.id,
                m.facts.title.as_deref().unwrap_or("untitled")
            ),
            MediaItem::Show(s) => format!(
                "show {} ({})",
                s.id,
                s.title.as_deref().unwrap_or("untitled")
            ),
            MediaItem::Season(s) => format!("season {} (S{:02})", s.id, s.number),
            MediaItem::Episode(e) => format!("episode {} (E{:02})", e.facts.id, e.number),
        }
    }

    /// 直接子节点
    pub fn children(&self) -> Vec<MediaItem> {
        match self {
            MediaItem::Show(s) => s.seasons.iter().cloned().map(MediaItem::Season).collect(),
            MediaItem::Season(s) => s.episodes.iter().cloned().map(MediaItem::Episode).collect(),
            _ => Vec::new(),
        }
    }

    /// 所有后代ID（深度优先，先季后集）
    pub fn descendant_ids(&self) -> Vec<ItemId> {
        let mut ids = Vec::new();
        match self {
            MediaItem::Show(show) => {
                for season in &show.seasons {
                    ids.push(season.id);
                    ids.extend(season.episodes.iter().map(|e| e.facts.id));
                }
            }
            MediaItem::Season(season) => {
                ids.extend(season.episodes.iter().map(|e| e.facts.id));
            }
            _ => {}
        }
        ids
    }

    /// 在以自身为根的子树中查找节点，返回其拷贝
    pub fn find(&self, id: ItemId) -> Option<MediaItem> {
        if self.id() == id {
            return Some(self.clone());
        }
        match self {
            MediaItem::Show(show) => show.seasons.iter().find_map(|season| {
                if season.id == id {
                    Some(MediaItem::Season(season.clone()))
                } else {
                    season
                        .episodes
                        .iter()
                        .find(|e| e.facts.id == id)
                        .cloned()
                        .map(MediaItem::Episode)
                }
            }),
            MediaItem::Season(season) => season
                .episodes
                .iter()
                .find(|e| e.facts.id == id)
                .cloned()
                .map(MediaItem::Episode),
            _ => None,
        }
    }

    /// 祖先ID链（由近及远），仅在以自身为根的子树中查找
    pub fn ancestors_of(&self, id: ItemId) -> Vec<ItemId> {
        match self {
            MediaItem::Show(show) => {
                for season in &show.seasons {
                    if season.id == id {
                        return vec![show.id];
                    }
                    if season.episodes.iter().any(|e| e.facts.id == id) {
                        return vec![season.id, show.id];
                    }
                }
                Vec::new()
            }
            MediaItem::Season(season) if season.episodes.iter().any(|e| e.facts.id == id) => {
                vec![season.id]
            }
            _ => Vec::new(),
        }
    }

    /// 把节点写入以自身为根的树：同ID节点整体替换，否则挂到父节点下。
    /// 返回 `false` 表示该节点与本树无关。
    pub fn upsert_node(&mut self, mut node: MediaItem) -> OrchestratorResult<bool> {
        node.inherit_placement(self);

        if let Some(&current_parent) = self.ancestors_of(node.id()).first() {
            if node.parent_id() != Some(current_parent) {
                return Err(OrchestratorError::InvalidHierarchy(format!(
                    "条目 {} 已挂在 {} 下，不能改挂到 {:?}",
                    node.id(),
                    current_parent,
                    node.parent_id()
                )));
            }
        }

        if self.id() == node.id() {
            if self.kind() != node.kind() {
                return Err(OrchestratorError::InvalidHierarchy(format!(
                    "条目 {} 的类型从 {} 变为 {}",
                    node.id(),
                    self.kind(),
                    node.kind()
                )));
            }
            *self = node;
            return Ok(true);
        }

        match (self, node) {
            (MediaItem::Show(show), MediaItem::Season(season)) if season.parent_id == show.id => {
                match show.seasons.iter_mut().find(|s| s.id == season.id) {
                    Some(existing) => *existing = season,
                    None => {
                        show.seasons.push(season);
                        show.seasons.sort_by_key(|s| s.number);
                    }
                }
                Ok(true)
            }
            (MediaItem::Show(show), node) => {
                let mut node = Some(node);
                for season in show.seasons.iter_mut() {
                    let mut season_item = MediaItem::Season(season.clone());
                    let Some(candidate) = node.take() else {
                        break;
                    };
                    if season_item.contains(candidate.id())
                        || candidate.parent_id() == Some(season.id)
                    {
                        if !season_item.upsert_node(candidate)? {
                            return Ok(false);
                        }
                        if let MediaItem::Season(updated) = season_item {
                            *season = updated;
                        }
                        return Ok(true);
                    }
                    node = Some(candidate);
                }
                Ok(false)
            }
            (MediaItem::Season(season), MediaItem::Episode(episode))
                if episode.parent_id == season.id =>
            {
                match season
                    .episodes
                    .iter_mut()
                    .find(|e| e.facts.id == episode.facts.id)
                {
                    Some(existing) => *existing = episode,
                    None => {
                        season.episodes.push(episode);
                        season.episodes.sort_by_key(|e| e.number);
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// 沿用已存储树中同ID叶子的放置标记，新节点缺少标记时不会把它清掉
    fn inherit_placement(&mut self, stored: &MediaItem) {
        for facts in self.leaf_facts_mut() {
            if facts.placed_at.is_none() {
                facts.placed_at = stored
                    .find(facts.id)
                    .and_then(|item| item.facts().and_then(ItemFacts::placed_at));
            }
        }
    }

    fn leaf_facts_mut(&mut self) -> Vec<&mut ItemFacts> {
        match self {
            MediaItem::Movie(m) => vec![&mut m.facts],
            MediaItem::Episode(e) => vec![&mut e.facts],
            MediaItem::Season(s) => s.episodes.iter_mut().map(|e| &mut e.facts).collect(),
            MediaItem::Show(s) => s
                .seasons
                .iter_mut()
                .flat_map(|season| season.episodes.iter_mut().map(|e| &mut e.facts))
                .collect(),
        }
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.id() == id || self.descendant_ids().contains(&id)
    }

    /// 入库前的层级校验：ID不能重复，子节点的 parent_id 必须指向实际父节点
    pub fn validate(&self) -> OrchestratorResult<()> {
        let mut seen = HashSet::new();
        if !seen.insert(self.id()) {
            return Err(duplicate(self.id()));
        }
        match self {
            MediaItem::Show(show) => {
                for season in &show.seasons {
                    if season.parent_id != show.id {
                        return Err(mismatched(season.id, season.parent_id, show.id));
                    }
                    validate_season(season, &mut seen)?;
                }
            }
            MediaItem::Season(season) => {
                for episode in &season.episodes {
                    check_episode(season, episode, &mut seen)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn validate_season(season: &Season, seen: &mut HashSet<ItemId>) -> OrchestratorResult<()> {
    if !seen.insert(season.id) {
        return Err(duplicate(season.id));
    }
    for episode in &season.episodes {
        check_episode(season, episode, seen)?;
    }
    Ok(())
}

fn check_episode(
    season: &Season,
    episode: &Episode,
    seen: &mut HashSet<ItemId>,
) -> OrchestratorResult<()> {
    if episode.parent_id != season.id {
        return Err(mismatched(episode.facts.id, episode.parent_id, season.id));
    }
    if !seen.insert(episode.facts.id) {
        return Err(duplicate(episode.facts.id));
    }
    Ok(())
}

fn duplicate(id: ItemId) -> OrchestratorError {
    OrchestratorError::InvalidHierarchy(format!("重复的条目ID: {id}"))
}

fn mismatched(id: ItemId, declared: ItemId, actual: ItemId) -> OrchestratorError {
    OrchestratorError::InvalidHierarchy(format!(
        "条目 {id} 声明的父节点为 {declared}，实际父节点为 {actual}"
    ))
}
