//! Service doubles for dispatcher and worker tests

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use orchestrator_domain::{
    ItemId, JobType, MediaItem, MediaService, ServiceContext, ServiceRole, Stream,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use tokio::sync::watch;

pub type Behavior =
    Arc<dyn Fn(Option<MediaItem>, u32) -> OrchestratorResult<Vec<MediaItem>> + Send + Sync>;

/// Push an item one step along the pipeline, the way a well-behaved processor would.
pub fn advance_item(mut item: MediaItem, job_type: JobType) -> MediaItem {
    let now = Utc::now();
    if let MediaItem::Show(show) = &mut item {
        if job_type == JobType::Index {
            show.indexed_at = Some(now);
        }
        return item;
    }

    let id = item.id();
    if let Some(facts) = item.facts_mut() {
        match job_type {
            JobType::Index => {
                if facts.title.is_none() {
                    facts.title = Some(format!("item-{id}"));
                }
                facts.indexed_at = Some(now);
            }
            JobType::Scrape => facts
                .streams
                .push(Stream::new(format!("hash-{id}"), "release.1080p").cached()),
            JobType::Download => {
                facts.file = Some(format!("{id}.mkv"));
                facts.folder = Some(format!("folder-{id}"));
            }
            JobType::Symlink => facts.symlinked = true,
            JobType::Update => facts.mark_placed(now),
            JobType::PostProcess => facts.post_processed = true,
        }
    }
    item
}

/// Scripted `MediaService`: counts calls, can fail a number of times,
/// and can block until released or cancelled.
pub struct ScriptedService {
    key: String,
    job_type: Option<JobType>,
    role: ServiceRole,
    behavior: Behavior,
    initialized: AtomicBool,
    calls: AtomicU32,
    failures_left: AtomicU32,
    cancelled: AtomicU32,
    gate: Option<watch::Sender<bool>>,
    ignores_cancel: bool,
    seen: Mutex<Vec<Option<ItemId>>>,
}

impl ScriptedService {
    pub fn with_behavior(key: &str, job_type: Option<JobType>, behavior: Behavior) -> Self {
        Self {
            key: key.to_string(),
            job_type,
            role: ServiceRole::Processor,
            behavior,
            initialized: AtomicBool::new(true),
            calls: AtomicU32::new(0),
            failures_left: AtomicU32::new(0),
            cancelled: AtomicU32::new(0),
            gate: None,
            ignores_cancel: false,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Processor that advances every item it is given by one step
    pub fn advancing(key: &str, job_type: JobType) -> Self {
        Self::with_behavior(
            key,
            Some(job_type),
            Arc::new(move |item, _| Ok(item.map(|i| advance_item(i, job_type)).into_iter().collect())),
        )
    }

    /// Processor that returns its input unchanged
    pub fn noop(key: &str, job_type: JobType) -> Self {
        Self::with_behavior(key, Some(job_type), Arc::new(|item, _| Ok(item.into_iter().collect())))
    }

    /// Processor that always fails with the given error
    pub fn failing(key: &str, job_type: JobType, error: fn() -> OrchestratorError) -> Self {
        Self::with_behavior(key, Some(job_type), Arc::new(move |_, _| Err(error())))
    }

    /// Content source producing the same items on every poll
    pub fn source(key: &str, items: Vec<MediaItem>) -> Self {
        let mut service =
            Self::with_behavior(key, None, Arc::new(move |_, _| Ok(items.clone())));
        service.role = ServiceRole::Source;
        service
    }

    /// Fail the first `n` calls with a transient service error
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Block every call until [`ScriptedService::release`] or cancellation
    pub fn blocking(mut self) -> Self {
        let (tx, _rx) = watch::channel(false);
        self.gate = Some(tx);
        self
    }

    /// Like [`ScriptedService::blocking`], but a cancelled call keeps waiting
    /// for release and then returns its normal result
    pub fn ignoring_cancellation(self) -> Self {
        let mut service = self.blocking();
        service.ignores_cancel = true;
        service
    }

    pub fn uninitialized(self) -> Self {
        self.initialized.store(false, Ordering::SeqCst);
        self
    }

    pub fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::SeqCst);
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.send_replace(true);
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cancellations(&self) -> u32 {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn seen_items(&self) -> Vec<Option<ItemId>> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MediaService for ScriptedService {
    fn key(&self) -> &str {
        &self.key
    }

    fn job_type(&self) -> Option<JobType> {
        self.job_type
    }

    fn role(&self) -> ServiceRole {
        self.role
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        item: Option<MediaItem>,
        ctx: &ServiceContext,
    ) -> OrchestratorResult<Vec<MediaItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(item.as_ref().map(MediaItem::id));
        }

        if let Some(gate) = &self.gate {
            let mut open = gate.subscribe();
            if self.ignores_cancel {
                let _ = open.wait_for(|released| *released).await;
            } else {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        self.cancelled.fetch_add(1, Ordering::SeqCst);
                        return Err(OrchestratorError::Cancelled);
                    }
                    _ = open.wait_for(|released| *released) => {}
                }
            }
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OrchestratorError::service(&self.key, "scripted failure"));
        }

        (self.behavior)(item, ctx.attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::LeafBuilder;
    use orchestrator_domain::{derive_state, MediaItemState};

    #[test]
    fn test_advance_item_walks_the_pipeline() {
        let mut item = LeafBuilder::movie(1).build();
        let steps = [
            (JobType::Index, MediaItemState::Indexed),
            (JobType::Scrape, MediaItemState::Scraped),
            (JobType::Download, MediaItemState::Downloaded),
            (JobType::Symlink, MediaItemState::Symlinked),
            (JobType::Update, MediaItemState::Completed),
        ];
        for (job_type, expected) in steps {
            item = advance_item(item, job_type);
            assert_eq!(derive_state(&item, Utc::now()), expected);
        }
    }

    #[tokio::test]
    async fn test_failing_first_then_succeeds() {
        let service = ScriptedService::noop("scraper", JobType::Scrape).failing_first(2);
        let ctx = ServiceContext::default();
        let item = LeafBuilder::movie(3).build();

        assert!(service.run(Some(item.clone()), &ctx).await.is_err());
        assert!(service.run(Some(item.clone()), &ctx).await.is_err());
        assert_eq!(service.run(Some(item), &ctx).await.unwrap().len(), 1);
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn test_blocking_service_observes_cancellation() {
        let service = ScriptedService::noop("downloader", JobType::Download).blocking();
        let ctx = ServiceContext::default();
        ctx.cancel.cancel();

        let result = service.run(None, &ctx).await;
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
        assert_eq!(service.cancellations(), 1);
    }
}
