//! Test data builders for creating media items

use chrono::{DateTime, Utc};
use orchestrator_domain::{
    Episode, ExternalIds, ItemFacts, ItemId, MediaItem, Movie, Season, Show, Stream,
};

/// Builder for Movie and Episode leaves
pub struct LeafBuilder {
    facts: ItemFacts,
    episode_of: Option<(ItemId, u32)>,
}

impl LeafBuilder {
    pub fn movie(id: ItemId) -> Self {
        Self {
            facts: ItemFacts::new(id),
            episode_of: None,
        }
    }

    pub fn episode(id: ItemId, season_id: ItemId, number: u32) -> Self {
        Self {
            facts: ItemFacts::new(id),
            episode_of: Some((season_id, number)),
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.facts.title = Some(title.to_string());
        self
    }

    pub fn requested_by(mut self, source: &str) -> Self {
        self.facts.requested_by = Some(source.to_string());
        self.facts.requested_at = Some(Utc::now());
        self
    }

    pub fn indexed(mut self) -> Self {
        if self.facts.title.is_none() {
            self.facts.title = Some(format!("item-{}", self.facts.id));
        }
        self.facts.indexed_at = Some(Utc::now());
        self
    }

    pub fn aired_at(mut self, at: DateTime<Utc>) -> Self {
        self.facts.aired_at = Some(at);
        self
    }

    pub fn stream(mut self, stream: Stream) -> Self {
        self.facts.streams.push(stream);
        self
    }

    pub fn cached_stream(self) -> Self {
        let hash = format!("hash-{}", self.facts.id);
        self.stream(Stream::new(hash, "release.1080p").cached())
    }

    pub fn downloaded(mut self) -> Self {
        self.facts.file = Some(format!("{}.mkv", self.facts.id));
        self.facts.folder = Some(format!("folder-{}", self.facts.id));
        self
    }

    pub fn symlinked(mut self) -> Self {
        self.facts.symlinked = true;
        self
    }

    pub fn placed(mut self) -> Self {
        self.facts.mark_placed(Utc::now());
        self
    }

    /// placed and post-processed: nothing left to do
    pub fn finished(mut self) -> Self {
        self.facts.mark_placed(Utc::now());
        self.facts.post_processed = true;
        self
    }

    pub fn build_episode(self) -> Episode {
        let (parent_id, number) = self.episode_of.unwrap_or((0, 1));
        Episode {
            parent_id,
            number,
            facts: self.facts,
        }
    }

    pub fn build(self) -> MediaItem {
        match self.episode_of {
            Some(_) => MediaItem::Episode(self.build_episode()),
            None => MediaItem::Movie(Movie { facts: self.facts }),
        }
    }
}

pub struct SeasonBuilder {
    season: Season,
}

impl SeasonBuilder {
    pub fn new(id: ItemId, show_id: ItemId, number: u32) -> Self {
        Self {
            season: Season {
                id,
                parent_id: show_id,
                number,
                aired_at: None,
                episodes: Vec::new(),
            },
        }
    }

    pub fn aired_at(mut self, at: DateTime<Utc>) -> Self {
        self.season.aired_at = Some(at);
        self
    }

    pub fn episode(mut self, episode: LeafBuilder) -> Self {
        self.season.episodes.push(episode.build_episode());
        self
    }

    pub fn build_season(self) -> Season {
        self.season
    }

    pub fn build(self) -> MediaItem {
        MediaItem::Season(self.season)
    }
}

pub struct ShowBuilder {
    show: Show,
}

impl ShowBuilder {
    pub fn new(id: ItemId) -> Self {
        Self {
            show: Show {
                id,
                title: Some(format!("show-{id}")),
                external_ids: ExternalIds::default(),
                aired_at: None,
                requested_by: None,
                indexed_at: Some(Utc::now()),
                seasons: Vec::new(),
            },
        }
    }

    pub fn unindexed(mut self) -> Self {
        self.show.indexed_at = None;
        self
    }

    pub fn season(mut self, season: SeasonBuilder) -> Self {
        self.show.seasons.push(season.build_season());
        self
    }

    pub fn build(self) -> MediaItem {
        MediaItem::Show(self.show)
    }
}
