use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use orchestrator_domain::{is_incomplete, ItemId, ItemRelations, ItemRepository, MediaItem};
use orchestrator_errors::OrchestratorResult;

use super::{lookup_keys, merge_into_root, relations_in, tree_ids};

/// SQLite条目仓储：每棵根树存一行JSON，另有一张ID索引表
pub struct SqliteItemRepository {
    pool: SqlitePool,
}

impl SqliteItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 连接数据库并自动建表
    pub async fn connect(database_url: &str) -> OrchestratorResult<Self> {
        debug!("Creating SQLite item repository at: {}", database_url);

        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // 内存数据库每个连接都是独立的库，只能用单连接
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> OrchestratorResult<()> {
        debug!("Running SQLite database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_trees (
                root_id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_index (
                item_id INTEGER PRIMARY KEY,
                root_id INTEGER NOT NULL,
                FOREIGN KEY (root_id) REFERENCES media_trees(root_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_media_index_root ON media_index(root_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    async fn load_root_of(&self, id: ItemId) -> OrchestratorResult<Option<MediaItem>> {
        let row = sqlx::query(
            "SELECT t.data FROM media_index i JOIN media_trees t ON t.root_id = i.root_id WHERE i.item_id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> OrchestratorResult<MediaItem> {
            let data: String = row.try_get("data")?;
            Ok(serde_json::from_str(&data)?)
        })
        .transpose()
    }
}

#[async_trait]
impl ItemRepository for SqliteItemRepository {
    #[instrument(skip(self))]
    async fn get(&self, id: ItemId) -> OrchestratorResult<Option<MediaItem>> {
        Ok(self.load_root_of(id).await?.and_then(|root| root.find(id)))
    }

    #[instrument(skip(self, item), fields(item_id = item.id()))]
    async fn upsert(&self, item: &MediaItem) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await?;

        let mut existing = None;
        for key in lookup_keys(item) {
            let row = sqlx::query(
                "SELECT t.data FROM media_index i JOIN media_trees t ON t.root_id = i.root_id WHERE i.item_id = ?",
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                let data: String = row.try_get("data")?;
                existing = Some(serde_json::from_str::<MediaItem>(&data)?);
                break;
            }
        }

        let root = merge_into_root(existing, item)?;
        let data = serde_json::to_string(&root)?;

        sqlx::query(
            r#"
            INSERT INTO media_trees (root_id, kind, data, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(root_id) DO UPDATE SET
                kind = excluded.kind,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(root.id())
        .bind(root.kind())
        .bind(&data)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM media_index WHERE root_id = ?")
            .bind(root.id())
            .execute(&mut *tx)
            .await?;
        for id in tree_ids(&root) {
            sqlx::query("INSERT OR REPLACE INTO media_index (item_id, root_id) VALUES (?, ?)")
                .bind(id)
                .bind(root.id())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!("条目已写入SQLite仓储: {}", item.log_string());
        Ok(())
    }

    async fn relations(&self, id: ItemId) -> OrchestratorResult<ItemRelations> {
        Ok(self
            .load_root_of(id)
            .await?
            .map(|root| relations_in(&root, id))
            .unwrap_or_default())
    }

    async fn incomplete_ids(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<ItemId>> {
        let rows = sqlx::query("SELECT data FROM media_trees ORDER BY root_id")
            .fetch_all(&self.pool)
            .await?;

        let mut ids = Vec::new();
        for row in rows {
            let data: String = row.try_get("data")?;
            let root: MediaItem = serde_json::from_str(&data)?;
            if is_incomplete(&root, now) {
                ids.push(root.id());
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::{Episode, ItemFacts, Movie, Season, Show, Stream};

    async fn repo() -> SqliteItemRepository {
        SqliteItemRepository::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_and_child_upsert() {
        let repo = repo().await;
        let show = MediaItem::Show(Show {
            id: 7,
            title: Some("Shogun".to_string()),
            external_ids: Default::default(),
            aired_at: None,
            requested_by: Some("trakt".to_string()),
            indexed_at: None,
            seasons: vec![Season {
                id: 70,
                parent_id: 7,
                number: 1,
                aired_at: None,
                episodes: vec![],
            }],
        });
        repo.upsert(&show).await.unwrap();
        assert_eq!(repo.get(7).await.unwrap(), Some(show));

        let mut facts = ItemFacts::new(700);
        facts.streams.push(Stream::new("hash", "Shogun.S01E01").cached());
        let episode = MediaItem::Episode(Episode {
            parent_id: 70,
            number: 1,
            facts,
        });
        repo.upsert(&episode).await.unwrap();

        assert_eq!(repo.get(700).await.unwrap(), Some(episode.clone()));
        assert_eq!(repo.relations(700).await.unwrap().ancestors, vec![70, 7]);
        assert_eq!(repo.relations(7).await.unwrap().descendants, vec![70, 700]);

        // 重复写入不会产生重复行
        repo.upsert(&episode).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media_index")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_incomplete_ids() {
        let repo = repo().await;
        let mut placed = ItemFacts::new(1);
        placed.mark_placed(Utc::now());
        placed.post_processed = true;
        repo.upsert(&MediaItem::Movie(Movie { facts: placed }))
            .await
            .unwrap();
        repo.upsert(&MediaItem::Movie(Movie {
            facts: ItemFacts::new(2),
        }))
        .await
        .unwrap();

        assert_eq!(repo.incomplete_ids(Utc::now()).await.unwrap(), vec![2]);
        assert!(repo.get(99).await.unwrap().is_none());
    }
}
