use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use orchestrator_config::EventManagerConfig;
use orchestrator_dispatcher::{CancelSummary, EventManager};
use orchestrator_domain::{
    derive_state, EmittedBy, Event, ItemRepository, JobType, MediaItemState, OrchestratorError,
    ServiceRegistry,
};
use orchestrator_infrastructure::InMemoryItemRepository;
use orchestrator_testing_utils::{
    LeafBuilder, ScriptedService, SeasonBuilder, ShowBuilder, TestEnv,
};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EventManagerConfig {
    EventManagerConfig {
        poll_interval_ms: 20,
        ..EventManagerConfig::default()
    }
}

fn manager(repo: &Arc<InMemoryItemRepository>, registry: ServiceRegistry) -> Arc<EventManager> {
    Arc::new(EventManager::new(repo.clone(), registry, config()))
}

fn start(manager: &Arc<EventManager>) -> (broadcast::Sender<()>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let manager = manager.clone();
    let handle = tokio::spawn(async move {
        manager.run(shutdown_rx).await.unwrap();
    });
    (shutdown_tx, handle)
}

async fn stop(shutdown_tx: broadcast::Sender<()>, handle: JoinHandle<()>) {
    let _ = shutdown_tx.send(());
    handle.await.unwrap();
}

async fn state_of(repo: &InMemoryItemRepository, id: i64) -> Option<MediaItemState> {
    repo.get(id)
        .await
        .unwrap()
        .map(|item| derive_state(&item, Utc::now()))
}

fn show_with_episodes() -> orchestrator_domain::MediaItem {
    ShowBuilder::new(1)
        .season(
            SeasonBuilder::new(10, 1, 1)
                .episode(LeafBuilder::episode(100, 10, 1).indexed())
                .episode(LeafBuilder::episode(101, 10, 2).indexed())
                .episode(LeafBuilder::episode(102, 10, 3).indexed()),
        )
        .build()
}

#[tokio::test]
async fn test_add_event_twice_is_deduplicated() {
    let repo = Arc::new(InMemoryItemRepository::new());
    repo.upsert(&LeafBuilder::movie(1).build()).await.unwrap();
    let manager = manager(&repo, ServiceRegistry::new());

    let first = manager.add_event(Event::new(EmittedBy::Manual, 1)).await.unwrap();
    let second = manager.add_event(Event::new(EmittedBy::Manual, 1)).await.unwrap();

    assert_eq!((first, second), (true, false));
    assert_eq!(manager.queued_count().await, 1);
}

#[tokio::test]
async fn test_related_items_are_deduplicated() {
    let repo = Arc::new(InMemoryItemRepository::new());
    repo.upsert(&show_with_episodes()).await.unwrap();
    let manager = manager(&repo, ServiceRegistry::new());

    assert!(manager.add_event(Event::new(EmittedBy::Manual, 100)).await.unwrap());
    // 祖先和后代都被挡住
    assert!(!manager.add_event(Event::new(EmittedBy::Manual, 10)).await.unwrap());
    assert!(!manager.add_event(Event::new(EmittedBy::Manual, 1)).await.unwrap());
    // 兄弟节点不相关
    assert!(manager.add_event(Event::new(EmittedBy::Manual, 101)).await.unwrap());
}

#[tokio::test]
async fn test_next_respects_run_at_with_fifo_ties() {
    let repo = Arc::new(InMemoryItemRepository::new());
    let manager = manager(&repo, ServiceRegistry::new());
    let now = Utc::now();

    manager
        .add_event(Event::scheduled(EmittedBy::System, 9, now + chrono::Duration::hours(1)))
        .await
        .unwrap();
    assert!(manager.next().await.is_none());

    for id in [3, 1, 2] {
        manager
            .add_event(Event::scheduled(EmittedBy::System, id, now))
            .await
            .unwrap();
    }
    let mut order = Vec::new();
    while let Some(event) = manager.next().await {
        order.push(event.item_id);
    }
    assert_eq!(order, vec![3, 1, 2]);
    assert_eq!(manager.queued_count().await, 1);
}

#[tokio::test]
async fn test_movie_runs_through_the_whole_pipeline() {
    let repo = Arc::new(InMemoryItemRepository::new());
    let mut registry = ServiceRegistry::new();
    for (key, job_type) in [
        ("indexer", JobType::Index),
        ("scraper", JobType::Scrape),
        ("downloader", JobType::Download),
        ("symlinker", JobType::Symlink),
        ("updater", JobType::Update),
        ("post_processor", JobType::PostProcess),
    ] {
        registry.register(Arc::new(ScriptedService::advancing(key, job_type)));
    }
    let manager = manager(&repo, registry);

    let movie = LeafBuilder::movie(1).title("Dune").requested_by("overseerr").build();
    assert!(manager.add_item(movie, EmittedBy::Manual).await.unwrap());
    let (shutdown_tx, handle) = start(&manager);

    let finished = TestEnv::wait_for(
        || async {
            repo.get(1)
                .await
                .unwrap()
                .and_then(|item| item.facts().map(|facts| facts.post_processed))
                .unwrap_or(false)
        },
        WAIT,
    )
    .await;
    assert!(finished);
    assert_eq!(state_of(&repo, 1).await, Some(MediaItemState::Completed));
    assert!(TestEnv::wait_for(|| async { manager.running_ids().await.is_empty() }, WAIT).await);

    stop(shutdown_tx, handle).await;
}

#[tokio::test]
async fn test_cancel_show_while_episode_is_running() {
    let repo = Arc::new(InMemoryItemRepository::new());
    repo.upsert(&show_with_episodes()).await.unwrap();
    let scraper = Arc::new(ScriptedService::advancing("scraper", JobType::Scrape).blocking());
    let registry = ServiceRegistry::new().with(scraper.clone());
    let manager = manager(&repo, registry);

    let later = Utc::now() + chrono::Duration::hours(1);
    assert!(manager.add_event(Event::new(EmittedBy::Manual, 100)).await.unwrap());
    assert!(manager
        .add_event(Event::scheduled(EmittedBy::Manual, 101, later))
        .await
        .unwrap());
    assert!(manager
        .add_event(Event::scheduled(EmittedBy::Manual, 102, later))
        .await
        .unwrap());
    let (shutdown_tx, handle) = start(&manager);

    assert!(TestEnv::wait_for(|| async { scraper.calls() == 1 }, WAIT).await);
    assert_eq!(manager.running_ids().await, vec![100]);

    let summary = manager.cancel_job(1).await.unwrap();
    assert_eq!(
        summary,
        CancelSummary {
            removed_events: 2,
            cancelled_jobs: 1,
        }
    );
    assert_eq!(manager.queued_count().await, 0);

    assert!(TestEnv::wait_for(|| async { manager.running_ids().await.is_empty() }, WAIT).await);
    assert_eq!(scraper.cancellations(), 1);
    assert_eq!(state_of(&repo, 100).await, Some(MediaItemState::Indexed));

    // 完成回调之后同一部剧可以重新入队
    assert!(manager.add_event(Event::new(EmittedBy::Manual, 1)).await.unwrap());

    stop(shutdown_tx, handle).await;
}

#[tokio::test]
async fn test_cancelled_job_result_does_not_emit_followups() {
    let repo = Arc::new(InMemoryItemRepository::new());
    repo.upsert(&show_with_episodes()).await.unwrap();
    let scraper = Arc::new(
        ScriptedService::advancing("scraper", JobType::Scrape).ignoring_cancellation(),
    );
    let downloader = Arc::new(ScriptedService::advancing("downloader", JobType::Download));
    let registry = ServiceRegistry::new()
        .with(scraper.clone())
        .with(downloader.clone());
    let manager = manager(&repo, registry);

    assert!(manager.add_event(Event::new(EmittedBy::Manual, 100)).await.unwrap());
    let (shutdown_tx, handle) = start(&manager);
    assert!(TestEnv::wait_for(|| async { scraper.calls() == 1 }, WAIT).await);

    let summary = manager.cancel_job(1).await.unwrap();
    assert_eq!(summary.cancelled_jobs, 1);
    scraper.release();

    assert!(TestEnv::wait_for(|| async { manager.running_ids().await.is_empty() }, WAIT).await);
    assert_eq!(scraper.cancellations(), 0);
    // 已完成的副作用照常保存
    assert_eq!(state_of(&repo, 100).await, Some(MediaItemState::Scraped));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.queued_count().await, 0);
    assert!(manager.running_ids().await.is_empty());
    assert_eq!(downloader.calls(), 0);

    assert!(manager.add_event(Event::new(EmittedBy::Manual, 1)).await.unwrap());
    stop(shutdown_tx, handle).await;
}

#[tokio::test]
async fn test_service_failures_do_not_stop_the_loop() {
    let repo = Arc::new(InMemoryItemRepository::new());
    repo.upsert(&LeafBuilder::movie(1).build()).await.unwrap();
    repo.upsert(&LeafBuilder::movie(2).indexed().build()).await.unwrap();

    let indexer = Arc::new(ScriptedService::failing("indexer", JobType::Index, || {
        OrchestratorError::invalid_result("indexer", "missing imdb id")
    }));
    let scraper = Arc::new(ScriptedService::advancing("scraper", JobType::Scrape));
    let registry = ServiceRegistry::new()
        .with(indexer.clone())
        .with(scraper.clone());
    let manager = manager(&repo, registry);

    manager.add_event(Event::new(EmittedBy::Manual, 1)).await.unwrap();
    manager.add_event(Event::new(EmittedBy::Manual, 2)).await.unwrap();
    let (shutdown_tx, handle) = start(&manager);

    assert!(
        TestEnv::wait_for(
            || async { state_of(&repo, 2).await == Some(MediaItemState::Scraped) },
            WAIT
        )
        .await
    );
    assert!(TestEnv::wait_for(|| async { indexer.calls() >= 1 }, WAIT).await);
    assert!(TestEnv::wait_for(|| async { manager.running_ids().await.is_empty() }, WAIT).await);

    assert_eq!(state_of(&repo, 1).await, Some(MediaItemState::Unknown));
    assert!(manager.add_event(Event::new(EmittedBy::Manual, 1)).await.unwrap());

    stop(shutdown_tx, handle).await;
}

#[tokio::test]
async fn test_unrelated_results_are_discarded() {
    let repo = Arc::new(InMemoryItemRepository::new());
    repo.upsert(&LeafBuilder::movie(1).indexed().build()).await.unwrap();

    let scraper = Arc::new(ScriptedService::with_behavior(
        "scraper",
        Some(JobType::Scrape),
        Arc::new(|_, _| Ok(vec![LeafBuilder::movie(999).indexed().build()])),
    ));
    let manager = manager(&repo, ServiceRegistry::new().with(scraper.clone()));

    manager.add_event(Event::new(EmittedBy::Manual, 1)).await.unwrap();
    let (shutdown_tx, handle) = start(&manager);

    assert!(TestEnv::wait_for(|| async { scraper.calls() == 1 }, WAIT).await);
    assert!(TestEnv::wait_for(|| async { manager.running_ids().await.is_empty() }, WAIT).await);
    assert!(repo.get(999).await.unwrap().is_none());
    assert_eq!(state_of(&repo, 1).await, Some(MediaItemState::Indexed));

    stop(shutdown_tx, handle).await;
}

#[tokio::test]
async fn test_uninitialized_service_is_skipped() {
    let repo = Arc::new(InMemoryItemRepository::new());
    repo.upsert(&LeafBuilder::movie(1).indexed().build()).await.unwrap();
    let scraper = Arc::new(ScriptedService::advancing("scraper", JobType::Scrape).uninitialized());
    let manager = manager(&repo, ServiceRegistry::new().with(scraper.clone()));

    manager.add_event(Event::new(EmittedBy::Manual, 1)).await.unwrap();
    let (shutdown_tx, handle) = start(&manager);

    assert!(
        TestEnv::wait_for(
            || async { manager.queued_count().await == 0 && manager.running_ids().await.is_empty() },
            WAIT
        )
        .await
    );
    assert_eq!(scraper.calls(), 0);

    stop(shutdown_tx, handle).await;
}

#[tokio::test]
async fn test_source_items_are_stored_and_indexed() {
    let repo = Arc::new(InMemoryItemRepository::new());
    let source = Arc::new(ScriptedService::source(
        "watchlist",
        vec![LeafBuilder::movie(5).title("Heat").requested_by("watchlist").build()],
    ));
    let indexer = Arc::new(ScriptedService::advancing("indexer", JobType::Index));
    let registry = ServiceRegistry::new()
        .with(source.clone())
        .with(indexer.clone());
    let manager = manager(&repo, registry);
    let (shutdown_tx, handle) = start(&manager);

    assert!(
        TestEnv::wait_for(
            || async { state_of(&repo, 5).await == Some(MediaItemState::Indexed) },
            WAIT
        )
        .await
    );
    assert_eq!(indexer.seen_items(), vec![Some(5)]);

    stop(shutdown_tx, handle).await;
}

#[tokio::test]
async fn test_reload_resizes_service_pools() {
    let repo = Arc::new(InMemoryItemRepository::new());
    let manager = manager(&repo, ServiceRegistry::new());
    assert_eq!(manager.pool_size("scraper").await, 1);

    let mut pool_sizes = BTreeMap::new();
    pool_sizes.insert("scraper".to_string(), 3);
    manager
        .reload(EventManagerConfig {
            pool_sizes,
            ..config()
        })
        .await
        .unwrap();
    assert_eq!(manager.pool_size("scraper").await, 3);

    let invalid = EventManagerConfig {
        default_pool_size: 0,
        ..config()
    };
    assert!(manager.reload(invalid).await.is_err());
    assert_eq!(manager.pool_size("scraper").await, 3);
}

#[tokio::test]
async fn test_sweep_resubmits_incomplete_items() {
    let repo = Arc::new(InMemoryItemRepository::new());
    repo.upsert(&LeafBuilder::movie(1).build()).await.unwrap();
    repo.upsert(&LeafBuilder::movie(2).finished().build()).await.unwrap();
    let manager = manager(&repo, ServiceRegistry::new());

    assert_eq!(manager.sweep_incomplete().await.unwrap(), 1);
    assert_eq!(manager.sweep_incomplete().await.unwrap(), 0);
}
