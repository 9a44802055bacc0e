//! 进程内事件调度器
//!
//! 单一调度循环负责：按 `run_at` 出队事件、把条目路由到对应服务、
//! 处理服务结果并派生后续事件、周期扫描未完成条目、轮询内容源。
//! 服务在各自的有界线程池（信号量）里执行，结果经 mpsc 通道回到调度循环。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use orchestrator_config::EventManagerConfig;
use orchestrator_domain::{
    derive_state, route, EmittedBy, Event, ItemId, ItemRepository, MediaItem, MediaService,
    Route, ServiceContext, ServiceRegistry,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

use crate::event_queue::{EventQueue, RunningJob};

/// 一次服务调用的结果，由执行任务投递给调度循环
#[derive(Debug)]
pub struct JobOutcome {
    pub service_key: String,
    /// 内容源调用没有输入条目
    pub item_id: Option<ItemId>,
    pub result: OrchestratorResult<Vec<MediaItem>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelSummary {
    /// 从队列中删除的事件数
    pub removed_events: usize,
    /// 发出取消请求的运行任务数
    pub cancelled_jobs: usize,
}

struct ServicePool {
    size: usize,
    semaphore: Arc<Semaphore>,
}

pub struct EventManager {
    repo: Arc<dyn ItemRepository>,
    registry: ServiceRegistry,
    config: RwLock<EventManagerConfig>,
    queue: Mutex<EventQueue>,
    pools: Mutex<HashMap<String, ServicePool>>,
    enqueued: Notify,
    outcome_tx: mpsc::UnboundedSender<JobOutcome>,
    outcome_rx: Mutex<Option<mpsc::UnboundedReceiver<JobOutcome>>>,
}

impl EventManager {
    pub fn new(
        repo: Arc<dyn ItemRepository>,
        registry: ServiceRegistry,
        config: EventManagerConfig,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            repo,
            registry,
            config: RwLock::new(config),
            queue: Mutex::new(EventQueue::default()),
            pools: Mutex::new(HashMap::new()),
            enqueued: Notify::new(),
            outcome_tx,
            outcome_rx: Mutex::new(Some(outcome_rx)),
        }
    }

    /// 添加事件。条目本身或其任一祖先、后代已在队列或运行中时返回 `false`。
    #[instrument(skip(self, event), fields(item_id = event.item_id, emitted_by = %event.emitted_by))]
    pub async fn add_event(&self, event: Event) -> OrchestratorResult<bool> {
        let closure = self.repo.relations(event.item_id).await?.closure(event.item_id);

        let mut queue = self.queue.lock().await;
        if queue.is_busy(&closure) {
            debug!("条目或其关联条目已在队列或运行中，忽略事件");
            return Ok(false);
        }
        debug!("事件已入队, run_at={}", event.run_at);
        queue.push(event);
        drop(queue);

        self.enqueued.notify_one();
        Ok(true)
    }

    /// 校验并保存条目，然后为其添加事件
    pub async fn add_item(&self, item: MediaItem, emitted_by: EmittedBy) -> OrchestratorResult<bool> {
        item.validate()?;
        self.repo.upsert(&item).await?;
        info!("添加条目: {}", item.log_string());
        self.add_event(Event::new(emitted_by, item.id())).await
    }

    /// 取出已到期的队首事件
    pub async fn next(&self) -> Option<Event> {
        self.queue.lock().await.pop_due(Utc::now())
    }

    /// 把一次服务调用提交到该服务的线程池
    pub async fn submit_job(
        &self,
        service_key: &str,
        item: Option<MediaItem>,
        event: Option<Event>,
    ) -> OrchestratorResult<()> {
        let service = self
            .registry
            .get(service_key)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(service_key.to_string()))?;
        let item_id = item.as_ref().map(MediaItem::id);

        if !service.initialized() {
            debug!("服务 {} 未初始化，跳过提交", service_key);
            if let Some(id) = item_id {
                self.release(id).await;
            }
            return Ok(());
        }

        let cancel = match item_id {
            Some(id) => self.queue.lock().await.reserve(id, Some(service_key), event),
            None => CancellationToken::new(),
        };
        let pool = self.pool_for(service_key).await;
        self.spawn_run(service, item, pool, cancel);
        Ok(())
    }

    fn spawn_run(
        &self,
        service: Arc<dyn MediaService>,
        item: Option<MediaItem>,
        pool: Arc<Semaphore>,
        cancel: CancellationToken,
    ) {
        let outcome_tx = self.outcome_tx.clone();
        let service_key = service.key().to_string();
        let item_id = item.as_ref().map(MediaItem::id);

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
                permit = pool.acquire_owned() => match permit {
                    Ok(_permit) => {
                        debug!("服务 {} 开始处理条目 {:?}", service_key, item_id);
                        let ctx = ServiceContext::new(cancel.clone(), 1);
                        service.run(item, &ctx).await
                    }
                    Err(_) => Err(OrchestratorError::Internal(format!(
                        "服务 {service_key} 的线程池已关闭"
                    ))),
                },
            };

            let outcome = JobOutcome {
                service_key,
                item_id,
                result,
            };
            if outcome_tx.send(outcome).is_err() {
                warn!("调度器已停止，丢弃服务执行结果: item_id={:?}", item_id);
            }
        });
    }

    async fn pool_for(&self, service_key: &str) -> Arc<Semaphore> {
        let size = self.config.read().await.pool_size(service_key);
        let mut pools = self.pools.lock().await;
        let pool = pools
            .entry(service_key.to_string())
            .or_insert_with(|| ServicePool {
                size,
                semaphore: Arc::new(Semaphore::new(size)),
            });
        pool.semaphore.clone()
    }

    /// 服务当前生效的线程池大小
    pub async fn pool_size(&self, service_key: &str) -> usize {
        if let Some(pool) = self.pools.lock().await.get(service_key) {
            return pool.size;
        }
        self.config.read().await.pool_size(service_key)
    }

    async fn release(&self, item_id: ItemId) -> Option<RunningJob> {
        self.queue.lock().await.release(item_id)
    }

    /// 处理一次服务结果。所有错误都在这里记录，不会中断调度循环。
    #[instrument(skip(self, outcome), fields(service = %outcome.service_key, item_id = ?outcome.item_id))]
    pub async fn process_outcome(&self, outcome: JobOutcome) {
        let cancelled = match outcome.item_id {
            Some(id) => self
                .release(id)
                .await
                .is_some_and(|job| job.cancel.is_cancelled()),
            None => false,
        };

        match outcome.result {
            Ok(items) => {
                if cancelled {
                    debug!("任务已被取消，只保存结果，不派生后续事件");
                }
                match self
                    .apply_results(&outcome.service_key, outcome.item_id, items, !cancelled)
                    .await
                {
                    Ok(emitted) => debug!("服务结果已处理，派生事件 {} 个", emitted),
                    Err(e) => error!("保存服务结果失败: {}", e),
                }
            }
            Err(e) if e.is_benign() => debug!("服务执行被跳过: {}", e),
            Err(e) => error!("服务执行失败: {}", e),
        }
    }

    async fn apply_results(
        &self,
        service_key: &str,
        item_id: Option<ItemId>,
        items: Vec<MediaItem>,
        emit: bool,
    ) -> OrchestratorResult<usize> {
        let related = match item_id {
            Some(id) => Some(self.repo.relations(id).await?.closure(id)),
            None => None,
        };
        let now = Utc::now();
        let mut emitted = 0;

        for item in items {
            match &related {
                Some(closure) => {
                    let belongs = closure.contains(&item.id())
                        || item.parent_id().is_some_and(|parent| closure.contains(&parent));
                    if !belongs {
                        error!(
                            "服务 {} 返回了与输入无关的条目 {}，已丢弃",
                            service_key,
                            item.log_string()
                        );
                        continue;
                    }
                }
                None => {
                    if self.repo.get(item.id()).await?.is_some() {
                        debug!("内容源返回的条目 {} 已存在，跳过", item.log_string());
                        continue;
                    }
                }
            }
            if let Err(e) = item.validate() {
                error!("服务 {} 返回了无效条目 {}: {}", service_key, item.log_string(), e);
                continue;
            }

            let before = self
                .repo
                .get(item.id())
                .await?
                .map(|stored| derive_state(&stored, now));
            self.repo.upsert(&item).await?;

            let after = derive_state(&item, now);
            if before == Some(after) {
                debug!("条目 {} 状态未变化 ({})", item.log_string(), after);
                continue;
            }
            if !emit || route(&item, now) == Route::Idle {
                continue;
            }
            if self
                .add_event(Event::new(EmittedBy::service(service_key), item.id()))
                .await?
            {
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    /// 取消条目及其所有祖先、后代的排队事件和运行任务。
    /// 取消是建议性的：已经开始的服务可能仍会完成其副作用。
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, item_id: ItemId) -> OrchestratorResult<CancelSummary> {
        let closure = self.repo.relations(item_id).await?.closure(item_id);

        let mut queue = self.queue.lock().await;
        let summary = CancelSummary {
            removed_events: queue.remove_queued(&closure),
            cancelled_jobs: queue.cancel_running(&closure),
        };
        drop(queue);

        info!(
            "已取消条目 {} 的任务: 删除排队事件 {} 个, 取消运行任务 {} 个",
            item_id, summary.removed_events, summary.cancelled_jobs
        );
        Ok(summary)
    }

    /// 重新加载配置。已创建的线程池被丢弃，之后的提交使用新的大小；
    /// 扫描与轮询间隔在下次启动调度循环时生效。
    pub async fn reload(&self, config: EventManagerConfig) -> OrchestratorResult<()> {
        config
            .validate()
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        *self.config.write().await = config;
        self.pools.lock().await.clear();
        info!("事件调度器配置已重新加载");
        Ok(())
    }

    pub async fn queued_count(&self) -> usize {
        self.queue.lock().await.queued_len()
    }

    pub async fn running_ids(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self.queue.lock().await.running().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 扫描未完成的条目并为其添加事件，返回新入队的数量
    pub async fn sweep_incomplete(&self) -> OrchestratorResult<usize> {
        let ids = self.repo.incomplete_ids(Utc::now()).await?;
        let mut added = 0;
        for id in ids {
            if self.add_event(Event::new(EmittedBy::System, id)).await? {
                added += 1;
            }
        }
        if added > 0 {
            info!("未完成条目扫描: 重新提交 {} 个条目", added);
        }
        Ok(added)
    }

    /// 轮询所有已初始化的内容源
    pub async fn poll_sources(&self) {
        for source in self.registry.sources() {
            if !source.initialized() {
                continue;
            }
            debug!("轮询内容源: {}", source.key());
            if let Err(e) = self.submit_job(source.key(), None, None).await {
                error!("提交内容源 {} 失败: {}", source.key(), e);
            }
        }
    }

    async fn dispatch_ready(&self) {
        loop {
            let popped = self.queue.lock().await.pop_due_reserved(Utc::now());
            let Some((event, _cancel)) = popped else {
                break;
            };
            let item_id = event.item_id;
            if let Err(e) = self.dispatch_event(event).await {
                self.release(item_id).await;
                error!("分发条目 {} 的事件失败: {}", item_id, e);
            }
        }
    }

    async fn dispatch_event(&self, event: Event) -> OrchestratorResult<()> {
        let item_id = event.item_id;
        let Some(item) = self.repo.get(item_id).await? else {
            debug!("条目 {} 不存在，丢弃事件", item_id);
            self.release(item_id).await;
            return Ok(());
        };

        match route(&item, Utc::now()) {
            Route::Run(job_type) => match self.registry.for_job(job_type) {
                Some(service) => {
                    let key = service.key().to_string();
                    self.submit_job(&key, Some(item), Some(event)).await
                }
                None => {
                    warn!("没有处理 {} 任务的服务，条目 {} 暂不处理", job_type, item.log_string());
                    self.release(item_id).await;
                    Ok(())
                }
            },
            Route::Expand(children) => {
                self.release(item_id).await;
                for child in children {
                    self.add_event(Event::new(event.emitted_by.clone(), child))
                        .await?;
                }
                Ok(())
            }
            Route::Idle => {
                debug!("条目 {} 无需处理", item.log_string());
                self.release(item_id).await;
                Ok(())
            }
        }
    }

    async fn next_wait(&self, poll_interval: Duration) -> Duration {
        match self.queue.lock().await.next_run_at() {
            Some(run_at) => (run_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(poll_interval),
            None => poll_interval,
        }
    }

    /// 调度循环，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> OrchestratorResult<()> {
        let mut outcomes = self
            .outcome_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| OrchestratorError::Internal("事件调度循环已在运行".to_string()))?;

        let config = self.config.read().await.clone();
        let mut sweep = tokio::time::interval(config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sources = tokio::time::interval(config.source_interval());
        sources.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("事件调度循环已启动");
        loop {
            self.dispatch_ready().await;
            let wait = self.next_wait(config.poll_interval()).await;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止事件调度循环");
                    break;
                }
                Some(outcome) = outcomes.recv() => self.process_outcome(outcome).await,
                _ = self.enqueued.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_incomplete().await {
                        error!("未完成条目扫描失败: {}", e);
                    }
                }
                _ = sources.tick() => self.poll_sources().await,
            }
        }

        *self.outcome_rx.lock().await = Some(outcomes);
        Ok(())
    }
}
