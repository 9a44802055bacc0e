use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use orchestrator_domain::{
    derive_state, ItemRepository, JobBroker, JobMessage, JobType, MediaItemState,
    OrchestratorError, ServiceRegistry,
};
use orchestrator_infrastructure::{
    InMemoryItemRepository, InMemoryJobBroker, InMemoryLockStore, MetricsRegistry,
};
use orchestrator_testing_utils::{
    LeafBuilder, ScriptedService, SeasonBuilder, ShowBuilder, TestEnv,
};
use orchestrator_worker::{JobDisposition, JobState, JobWorker, WorkerSettings};

struct Harness {
    repo: Arc<InMemoryItemRepository>,
    broker: Arc<InMemoryJobBroker>,
    metrics: Arc<MetricsRegistry>,
    worker: Arc<JobWorker>,
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        worker_id: "worker-test".to_string(),
        poll_interval: Duration::from_millis(20),
        ..WorkerSettings::default()
    }
}

fn harness_with(registry: ServiceRegistry, settings: WorkerSettings) -> Harness {
    let repo = Arc::new(InMemoryItemRepository::new());
    let broker = Arc::new(InMemoryJobBroker::new());
    let metrics = Arc::new(MetricsRegistry::new(1000).unwrap());
    let worker = JobWorker::builder(settings)
        .repository(repo.clone())
        .broker(broker.clone())
        .lock_store(Arc::new(InMemoryLockStore::new()))
        .metrics(metrics.clone())
        .registry(registry)
        .build()
        .unwrap();
    Harness {
        repo,
        broker,
        metrics,
        worker: Arc::new(worker),
    }
}

fn harness(registry: ServiceRegistry) -> Harness {
    harness_with(registry, settings())
}

async fn state_of(repo: &InMemoryItemRepository, id: i64) -> Option<MediaItemState> {
    repo.get(id)
        .await
        .unwrap()
        .map(|item| derive_state(&item, Utc::now()))
}

async fn receive(h: &Harness, job: &JobMessage) -> JobMessage {
    h.broker.receive(&job.queue_name()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    let result = JobWorker::builder(settings()).build();
    assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
}

#[tokio::test]
async fn test_worker_drives_movie_to_completion() {
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
    let h = harness(registry);
    let movie = LeafBuilder::movie(1).title("Arrival").requested_by("trakt").build();
    h.repo.upsert(&movie).await.unwrap();
    assert_eq!(h.worker.producer().enqueue_for_item(&movie).await.unwrap().len(), 1);

    h.worker.start().await.unwrap();
    let finished = TestEnv::wait_for(
        || async {
            h.repo
                .get(1)
                .await
                .unwrap()
                .and_then(|item| item.facts().map(|facts| facts.post_processed))
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await;
    h.worker.stop().await.unwrap();

    assert!(finished);
    assert_eq!(state_of(&h.repo, 1).await, Some(MediaItemState::Completed));
    let completed = TestEnv::metric_lines(&h.metrics.render(), "jobs_completed_total");
    assert!(!completed.is_empty());
    assert!(completed.iter().all(|line| line.contains("success=\"true\"")));
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_once_without_touching_item() {
    let scraper = Arc::new(ScriptedService::failing("scraper", JobType::Scrape, || {
        OrchestratorError::service("scraper", "upstream 503")
    }));
    let h = harness(ServiceRegistry::new().with(scraper.clone()));
    h.repo.upsert(&LeafBuilder::movie(1).indexed().build()).await.unwrap();
    let before = state_of(&h.repo, 1).await;

    let first = h.worker.producer().enqueue(JobType::Scrape, 1).await.unwrap();
    let mut dispositions = Vec::new();
    for _ in 0..10 {
        let job = receive(&h, &first).await;
        let disposition = h.worker.handle_job(job).await.unwrap();
        dispositions.push(disposition);
        if disposition == JobDisposition::DeadLettered {
            break;
        }
    }

    assert_eq!(
        dispositions,
        vec![
            JobDisposition::Retried,
            JobDisposition::Retried,
            JobDisposition::Retried,
            JobDisposition::DeadLettered,
        ]
    );
    assert_eq!(scraper.calls(), 4);
    assert_eq!(state_of(&h.repo, 1).await, before);

    let rendered = h.metrics.render();
    let dlq = TestEnv::metric_lines(&rendered, "jobs_dlq_total");
    assert_eq!(dlq.len(), 1);
    assert!(dlq[0].contains("job_type=\"scrape\""));
    assert!(dlq[0].ends_with(" 1"));
    let retried = TestEnv::metric_lines(&rendered, "jobs_retried_total");
    assert!(retried[0].ends_with(" 3"));

    let letters = h.broker.dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job.metadata.attempt, 3);
    assert_eq!(
        h.worker.monitor().state(&first.job_id).await,
        Some(JobState::Failed)
    );
    assert_eq!(h.broker.in_flight_count().await, 0);
}

#[tokio::test]
async fn test_fatal_error_skips_retries() {
    let scraper = Arc::new(ScriptedService::failing("scraper", JobType::Scrape, || {
        OrchestratorError::invalid_result("scraper", "no streams field")
    }));
    let h = harness(ServiceRegistry::new().with(scraper));
    h.repo.upsert(&LeafBuilder::movie(1).indexed().build()).await.unwrap();

    let job = h.worker.producer().enqueue(JobType::Scrape, 1).await.unwrap();
    let job = receive(&h, &job).await;
    assert_eq!(
        h.worker.handle_job(job).await.unwrap(),
        JobDisposition::DeadLettered
    );
}

#[tokio::test]
async fn test_resubmit_dead_letters() {
    let scraper = Arc::new(
        ScriptedService::advancing("scraper", JobType::Scrape).failing_first(1),
    );
    let settings = WorkerSettings {
        max_retries: 0,
        ..settings()
    };
    let h = harness_with(ServiceRegistry::new().with(scraper.clone()), settings);
    h.repo.upsert(&LeafBuilder::movie(1).indexed().build()).await.unwrap();

    let job = h.worker.producer().enqueue(JobType::Scrape, 1).await.unwrap();
    let received = receive(&h, &job).await;
    assert_eq!(
        h.worker.handle_job(received).await.unwrap(),
        JobDisposition::DeadLettered
    );

    assert_eq!(h.worker.resubmit_dead_letters().await.unwrap(), 1);
    assert!(h.broker.dead_letters().await.unwrap().is_empty());
    assert_eq!(h.worker.monitor().state(&job.job_id).await, Some(JobState::Pending));

    let resubmitted = receive(&h, &job).await;
    assert_eq!(resubmitted.metadata.attempt, 0);
    assert_eq!(
        h.worker.handle_job(resubmitted).await.unwrap(),
        JobDisposition::Completed
    );
    assert_eq!(state_of(&h.repo, 1).await, Some(MediaItemState::Scraped));
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    let scraper = Arc::new(ScriptedService::advancing("scraper", JobType::Scrape));
    let h = harness(ServiceRegistry::new().with(scraper.clone()));
    h.repo.upsert(&LeafBuilder::movie(1).indexed().build()).await.unwrap();

    let job = h.worker.producer().enqueue(JobType::Scrape, 1).await.unwrap();
    let received = receive(&h, &job).await;
    assert_eq!(
        h.worker.handle_job(received.clone()).await.unwrap(),
        JobDisposition::Completed
    );
    assert_eq!(
        h.worker.handle_job(received).await.unwrap(),
        JobDisposition::Duplicate
    );
    assert_eq!(scraper.calls(), 1);

    // 另一条同类型任务到达时条目已推进，不再调用服务
    let stale = JobMessage::new(JobType::Scrape, 1, h.worker.producer().layout());
    assert_eq!(
        h.worker.handle_job(stale).await.unwrap(),
        JobDisposition::Skipped
    );
    assert_eq!(scraper.calls(), 1);
    assert_eq!(state_of(&h.repo, 1).await, Some(MediaItemState::Scraped));
}

#[tokio::test]
async fn test_missing_item_is_skipped() {
    let scraper = Arc::new(ScriptedService::advancing("scraper", JobType::Scrape));
    let h = harness(ServiceRegistry::new().with(scraper.clone()));

    let job = JobMessage::new(JobType::Scrape, 404, h.worker.producer().layout());
    assert_eq!(
        h.worker.handle_job(job.clone()).await.unwrap(),
        JobDisposition::Skipped
    );
    assert_eq!(scraper.calls(), 0);
    assert_eq!(
        h.worker.monitor().state(&job.job_id).await,
        Some(JobState::Completed)
    );
}

#[tokio::test]
async fn test_locked_item_parks_until_holder_completes() {
    let indexer = Arc::new(ScriptedService::noop("indexer", JobType::Index));
    let h = harness(ServiceRegistry::new().with(indexer.clone()));
    let show = ShowBuilder::new(1)
        .unindexed()
        .season(SeasonBuilder::new(10, 1, 1).episode(LeafBuilder::episode(100, 10, 1)))
        .build();
    h.repo.upsert(&show).await.unwrap();

    let holder = JobMessage::new(JobType::Scrape, 100, h.worker.producer().layout());
    assert!(h.worker.dependencies().start_job(&holder).await.unwrap());

    let job = h.worker.producer().enqueue(JobType::Index, 1).await.unwrap();
    let received = receive(&h, &job).await;
    assert_eq!(
        h.worker.handle_job(received).await.unwrap(),
        JobDisposition::Parked
    );
    assert_eq!(h.worker.monitor().state(&job.job_id).await, Some(JobState::Waiting));
    assert_eq!(indexer.calls(), 0);

    assert_eq!(h.worker.dependencies().complete_job(&holder.job_id).await.unwrap(), 1);
    let woken = receive(&h, &job).await;
    assert_eq!(
        h.worker.handle_job(woken).await.unwrap(),
        JobDisposition::Completed
    );
    assert_eq!(indexer.calls(), 1);
}

#[tokio::test]
async fn test_timeout_is_retried() {
    let downloader = Arc::new(ScriptedService::advancing("downloader", JobType::Download).blocking());
    let mut settings = settings();
    settings
        .time_limits
        .insert(JobType::Download, Duration::from_millis(50));
    let h = harness_with(ServiceRegistry::new().with(downloader.clone()), settings);
    h.repo
        .upsert(&LeafBuilder::movie(1).indexed().cached_stream().build())
        .await
        .unwrap();

    let job = h.worker.producer().enqueue(JobType::Download, 1).await.unwrap();
    let received = receive(&h, &job).await;
    assert_eq!(
        h.worker.handle_job(received).await.unwrap(),
        JobDisposition::Retried
    );
    assert_eq!(receive(&h, &job).await.metadata.attempt, 1);
    assert_eq!(h.worker.running_jobs().await, 0);
    assert_eq!(state_of(&h.repo, 1).await, Some(MediaItemState::Scraped));
}

#[tokio::test]
async fn test_recover_stale_jobs() {
    let h = harness(ServiceRegistry::new());
    let job = JobMessage::new(JobType::Update, 3, h.worker.producer().layout());
    h.worker.monitor().register_job(&job).await;
    h.worker.monitor().mark_running(&job.job_id).await.unwrap();

    assert_eq!(h.worker.recover_stale_jobs(Duration::from_secs(60)).await.unwrap(), 0);
    assert_eq!(h.worker.recover_stale_jobs(Duration::ZERO).await.unwrap(), 1);
    assert_eq!(h.worker.monitor().state(&job.job_id).await, Some(JobState::Pending));
    assert_eq!(receive(&h, &job).await.metadata.attempt, 1);
}

#[tokio::test]
async fn test_recover_stale_jobs_leaves_local_running_job_alone() {
    let downloader = Arc::new(ScriptedService::advancing("downloader", JobType::Download).blocking());
    let h = harness(ServiceRegistry::new().with(downloader.clone()));
    h.repo
        .upsert(&LeafBuilder::movie(1).indexed().cached_stream().build())
        .await
        .unwrap();

    let job = h.worker.producer().enqueue(JobType::Download, 1).await.unwrap();
    let received = receive(&h, &job).await;
    let worker = h.worker.clone();
    let handle = tokio::spawn(async move { worker.handle_job(received).await });

    let started = {
        let downloader = downloader.clone();
        TestEnv::wait_for(
            move || {
                let downloader = downloader.clone();
                async move { downloader.calls() == 1 }
            },
            Duration::from_secs(2),
        )
        .await
    };
    assert!(started);
    assert_eq!(h.worker.running_jobs().await, 1);

    assert_eq!(h.worker.recover_stale_jobs(Duration::ZERO).await.unwrap(), 0);
    assert!(h.broker.receive(&job.queue_name()).await.unwrap().is_none());
    assert_eq!(h.worker.monitor().state(&job.job_id).await, Some(JobState::Running));

    downloader.release();
    assert_eq!(handle.await.unwrap().unwrap(), JobDisposition::Completed);
    assert_eq!(downloader.calls(), 1);
    assert_eq!(h.worker.running_jobs().await, 0);
}
