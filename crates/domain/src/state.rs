//! 生命周期状态推导与路由
//!
//! 状态从不存储，只从条目事实（以及容器的子节点状态）推导。
//! 所有优先级规则集中在 [`derive_state`] 的一次类型分派里。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::{ItemFacts, ItemId, MediaItem, Season};
use crate::jobs::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaItemState {
    Unknown,
    Requested,
    Indexed,
    Scraped,
    Downloaded,
    Symlinked,
    Completed,
    PartiallyCompleted,
    Ongoing,
    Unreleased,
}

impl MediaItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaItemState::Unknown => "Unknown",
            MediaItemState::Requested => "Requested",
            MediaItemState::Indexed => "Indexed",
            MediaItemState::Scraped => "Scraped",
            MediaItemState::Downloaded => "Downloaded",
            MediaItemState::Symlinked => "Symlinked",
            MediaItemState::Completed => "Completed",
            MediaItemState::PartiallyCompleted => "PartiallyCompleted",
            MediaItemState::Ongoing => "Ongoing",
            MediaItemState::Unreleased => "Unreleased",
        }
    }
}

impl fmt::Display for MediaItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 推导条目状态。纯函数：不做I/O，不修改条目，`now` 显式传入
pub fn derive_state(item: &MediaItem, now: DateTime<Utc>) -> MediaItemState {
    match item {
        MediaItem::Movie(movie) => leaf_state(&movie.facts, now),
        MediaItem::Episode(episode) => leaf_state(&episode.facts, now),
        MediaItem::Season(season) => season_state(season, now),
        MediaItem::Show(show) => {
            let children: Vec<_> = show.seasons.iter().map(|s| season_state(s, now)).collect();
            container_state(&children, show.aired_at, MediaItemState::Unknown, now)
        }
    }
}

fn season_state(season: &Season, now: DateTime<Utc>) -> MediaItemState {
    let children: Vec<_> = season
        .episodes
        .iter()
        .map(|e| leaf_state(&e.facts, now))
        .collect();
    container_state(&children, season.aired_at, MediaItemState::Unreleased, now)
}

fn leaf_state(facts: &ItemFacts, now: DateTime<Utc>) -> MediaItemState {
    if facts.is_placed() {
        return MediaItemState::Completed;
    }
    if facts.symlinked {
        return MediaItemState::Symlinked;
    }
    if facts.file.is_some() && facts.folder.is_some() {
        return MediaItemState::Downloaded;
    }
    if facts.has_cached_stream() {
        return MediaItemState::Scraped;
    }
    if facts.is_scraped() && facts.is_checked_for_availability() {
        return MediaItemState::Scraped;
    }
    if facts.aired_at.is_some_and(|at| at > now) {
        return MediaItemState::Unreleased;
    }
    if facts.title.is_some() {
        if facts.requested_by.is_some() && facts.indexed_at.is_none() {
            return MediaItemState::Requested;
        }
        return MediaItemState::Indexed;
    }
    MediaItemState::Unknown
}

/// 容器规则只依赖子节点状态集合和容器自身的播出时间
pub fn container_state(
    children: &[MediaItemState],
    aired_at: Option<DateTime<Utc>>,
    empty: MediaItemState,
    now: DateTime<Utc>,
) -> MediaItemState {
    use MediaItemState::*;

    if children.is_empty() {
        return empty;
    }
    let all = |s: MediaItemState| children.iter().all(|c| *c == s);
    let any = |s: MediaItemState| children.contains(&s);

    if all(Completed) {
        return Completed;
    }
    if all(Unreleased) {
        return Unreleased;
    }
    let progressed = children.iter().any(|c| matches!(c, Completed | Ongoing));
    let settled = children
        .iter()
        .all(|c| matches!(c, Completed | Ongoing | Unreleased));
    if progressed && settled {
        return Ongoing;
    }
    if children
        .iter()
        .any(|c| matches!(c, Completed | PartiallyCompleted | Ongoing))
    {
        return PartiallyCompleted;
    }
    for state in [Symlinked, Downloaded, Scraped] {
        if any(state) {
            return state;
        }
    }
    if any(Unreleased) || aired_at.is_some_and(|at| at > now) {
        return Unreleased;
    }
    for state in [Indexed, Requested] {
        if any(state) {
            return state;
        }
    }
    Unknown
}

/// 条目下一步应该做什么
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Run(JobType),
    /// 容器本身没有任务，把需要处理的子节点拆出来
    Expand(Vec<ItemId>),
    Idle,
}

pub fn route(item: &MediaItem, now: DateTime<Utc>) -> Route {
    let state = derive_state(item, now);
    match item {
        MediaItem::Movie(_) | MediaItem::Episode(_) => leaf_route(item, state),
        MediaItem::Show(show) if show.indexed_at.is_none() => Route::Run(JobType::Index),
        MediaItem::Show(_) | MediaItem::Season(_) => {
            if state == MediaItemState::Unreleased {
                return Route::Idle;
            }
            let pending: Vec<ItemId> = item
                .children()
                .iter()
                .filter(|child| route(child, now) != Route::Idle)
                .map(MediaItem::id)
                .collect();
            if pending.is_empty() {
                Route::Idle
            } else {
                Route::Expand(pending)
            }
        }
    }
}

fn leaf_route(item: &MediaItem, state: MediaItemState) -> Route {
    match state {
        MediaItemState::Unknown | MediaItemState::Requested => Route::Run(JobType::Index),
        MediaItemState::Indexed => Route::Run(JobType::Scrape),
        MediaItemState::Scraped => Route::Run(JobType::Download),
        MediaItemState::Downloaded => Route::Run(JobType::Symlink),
        MediaItemState::Symlinked => Route::Run(JobType::Update),
        MediaItemState::Completed => match item.facts() {
            Some(facts) if !facts.post_processed => Route::Run(JobType::PostProcess),
            _ => Route::Idle,
        },
        _ => Route::Idle,
    }
}

pub fn is_incomplete(item: &MediaItem, now: DateTime<Utc>) -> bool {
    route(item, now) != Route::Idle
}
