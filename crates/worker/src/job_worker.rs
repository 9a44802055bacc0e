//! 分区任务Worker
//!
//! 每个订阅的分区队列一个拉取循环，同一分区同一时刻只处理一个任务，
//! 总并发由信号量限制。单个任务的处理流程：
//! 登记 -> 获取依赖锁（失败则挂起） -> 运行中 -> 加载条目 -> 幂等检查 ->
//! 在时间限制内执行服务 -> 保存结果并发布后续任务 -> 释放锁 -> 确认。
//! 失败时按错误分类完成、重试或进入死信队列，条目状态不会因失败而改变。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use orchestrator_domain::{
    derive_state, route, ItemRepository, JobBroker, JobMessage, LockStore, MediaItem,
    PartitionLayout, Route, ServiceContext, ServiceRegistry,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use orchestrator_infrastructure::MetricsRegistry;

use crate::dependency_manager::DependencyManager;
use crate::producer::JobProducer;
use crate::queue_monitor::QueueMonitor;
use crate::settings::WorkerSettings;

/// 单个任务的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    /// 服务执行成功
    Completed,
    /// 条目已删除、状态已推进或被取消，无需执行
    Skipped,
    /// 已经处理过的重复投递
    Duplicate,
    /// 依赖锁被占用，等待唤醒
    Parked,
    Retried,
    DeadLettered,
}

pub struct JobWorker {
    settings: WorkerSettings,
    repo: Arc<dyn ItemRepository>,
    broker: Arc<dyn JobBroker>,
    registry: ServiceRegistry,
    metrics: Arc<MetricsRegistry>,
    dependencies: Arc<DependencyManager>,
    monitor: Arc<QueueMonitor>,
    producer: Arc<JobProducer>,
    slots: Arc<Semaphore>,
    running: Mutex<HashMap<String, CancellationToken>>,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobWorker {
    pub fn builder(settings: WorkerSettings) -> JobWorkerBuilder {
        JobWorkerBuilder::new(settings)
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    pub fn monitor(&self) -> &Arc<QueueMonitor> {
        &self.monitor
    }

    pub fn producer(&self) -> &Arc<JobProducer> {
        &self.producer
    }

    pub fn dependencies(&self) -> &Arc<DependencyManager> {
        &self.dependencies
    }

    /// 订阅的分区队列
    pub fn queues(&self) -> Vec<String> {
        let layout = self.producer.layout();
        self.settings
            .job_types
            .iter()
            .flat_map(|job_type| layout.queues(*job_type))
            .collect()
    }

    pub async fn running_jobs(&self) -> usize {
        self.running.lock().await.len()
    }

    #[instrument(skip(self, job), fields(
        job_id = %job.job_id,
        job_type = %job.job_type,
        item_id = job.item_id,
        attempt = job.metadata.attempt
    ))]
    pub async fn handle_job(&self, job: JobMessage) -> OrchestratorResult<JobDisposition> {
        self.monitor.register_job(&job).await;
        if let Some(entry) = self.monitor.get(&job.job_id).await {
            if entry.state.is_terminal() && entry.job.metadata.attempt == job.metadata.attempt {
                debug!("重复投递的任务 (状态 {})，直接确认", entry.state);
                self.broker.ack(&job).await?;
                return Ok(JobDisposition::Duplicate);
            }
        }

        match self.dependencies.start_job(&job).await {
            Ok(true) => {}
            Ok(false) => {
                self.monitor.mark_waiting(&job.job_id).await?;
                self.broker.ack(&job).await?;
                return Ok(JobDisposition::Parked);
            }
            Err(e) => return self.fail(&job, e).await,
        }

        let cancel = CancellationToken::new();
        self.running
            .lock()
            .await
            .insert(job.job_id.clone(), cancel.clone());
        let result = self.run_locked(&job, cancel).await;
        self.running.lock().await.remove(&job.job_id);
        if let Err(e) = self.dependencies.complete_job(&job.job_id).await {
            warn!("唤醒等待任务失败: {}", e);
        }

        match result {
            Ok(disposition) => {
                self.finish(&job).await?;
                Ok(disposition)
            }
            Err(e) if e.is_benign() => {
                debug!("任务被跳过: {}", e);
                self.finish(&job).await?;
                Ok(JobDisposition::Skipped)
            }
            Err(e) => self.fail(&job, e).await,
        }
    }

    async fn run_locked(
        &self,
        job: &JobMessage,
        cancel: CancellationToken,
    ) -> OrchestratorResult<JobDisposition> {
        self.monitor.mark_running(&job.job_id).await?;
        self.metrics.mark_started(job);

        let Some(item) = self.repo.get(job.item_id).await? else {
            debug!("条目不存在，跳过任务");
            return Ok(JobDisposition::Skipped);
        };
        if route(&item, Utc::now()) != Route::Run(job.job_type) {
            debug!("条目 {} 已不需要 {} 任务", item.log_string(), job.job_type);
            return Ok(JobDisposition::Skipped);
        }

        let service = self.registry.require_for_job(job.job_type)?;
        let ctx = ServiceContext::new(cancel.clone(), job.metadata.attempt);
        let limit = self.settings.time_limit(job.job_type);
        let result = tokio::time::timeout(limit, service.run(Some(item), &ctx)).await;

        let items = match result {
            Ok(items) => items?,
            Err(_) => {
                cancel.cancel();
                warn!("服务 {} 执行超时 ({:?})", service.key(), limit);
                return Err(OrchestratorError::ExecutionTimeout);
            }
        };

        let published = self.apply_results(job, service.key(), items).await?;
        debug!("任务完成，发布后续任务 {} 个", published);
        Ok(JobDisposition::Completed)
    }

    async fn apply_results(
        &self,
        job: &JobMessage,
        service_key: &str,
        items: Vec<MediaItem>,
    ) -> OrchestratorResult<usize> {
        let closure = self.repo.relations(job.item_id).await?.closure(job.item_id);
        let now = Utc::now();
        let mut published = 0;

        for item in items {
            let belongs = closure.contains(&item.id())
                || item.parent_id().is_some_and(|parent| closure.contains(&parent));
            if !belongs {
                error!(
                    "服务 {} 返回了与任务无关的条目 {}，已丢弃",
                    service_key,
                    item.log_string()
                );
                continue;
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
            if before == Some(derive_state(&item, now)) {
                continue;
            }
            published += self.producer.enqueue_for_item(&item).await?.len();
        }
        Ok(published)
    }

    async fn finish(&self, job: &JobMessage) -> OrchestratorResult<()> {
        self.monitor.mark_completed(&job.job_id).await?;
        self.metrics.mark_completed(job, true);
        self.broker.ack(job).await
    }

    async fn fail(
        &self,
        job: &JobMessage,
        error: OrchestratorError,
    ) -> OrchestratorResult<JobDisposition> {
        if error.is_retryable() && job.metadata.attempt < self.settings.max_retries {
            warn!(
                "任务失败，重新入队 (第 {}/{} 次重试): {}",
                job.metadata.attempt + 1,
                self.settings.max_retries,
                error
            );
            self.producer.retry(job).await?;
            self.broker.ack(job).await?;
            return Ok(JobDisposition::Retried);
        }

        error!("任务失败，进入死信队列: {}", error);
        self.broker.dead_letter(job, &error.to_string()).await?;
        self.metrics.mark_dlq(job);
        self.metrics.mark_completed(job, false);
        self.monitor.mark_failed(&job.job_id).await?;
        Ok(JobDisposition::DeadLettered)
    }

    /// 把死信队列中的任务以全新的尝试次数重新发布
    pub async fn resubmit_dead_letters(&self) -> OrchestratorResult<usize> {
        let letters = self.broker.take_dead_letters().await?;
        let mut count = 0;
        for letter in letters {
            let mut job = letter.job;
            job.metadata.attempt = 0;
            job.enqueued_at = Utc::now();
            if let Err(e) = self.monitor.mark_retry(&job).await {
                warn!("死信任务 {} 无法重新提交: {}", job.job_id, e);
                continue;
            }
            self.producer.publish(&job).await?;
            count += 1;
        }
        if count > 0 {
            info!("重新提交了 {} 个死信任务", count);
        }
        Ok(count)
    }

    /// 重新发布运行时间过长的任务，通常是执行它的进程崩溃了。
    /// 本进程仍在执行的任务不会被重新发布。
    pub async fn recover_stale_jobs(&self, older_than: Duration) -> OrchestratorResult<usize> {
        let stale = self.monitor.stale_running(older_than).await;
        // 持有锁直到处理完，期间不会有任务登记或注销
        let running = self.running.lock().await;
        let mut recovered = 0;
        for job in &stale {
            if running.contains_key(&job.job_id) {
                debug!(job_id = %job.job_id, "任务仍在本进程执行，不重新入队");
                continue;
            }
            warn!(job_id = %job.job_id, "任务运行超时未结束，重新入队");
            self.dependencies.complete_job(&job.job_id).await?;
            self.producer.retry(job).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// 启动分区拉取循环和维护循环
    pub async fn start(self: &Arc<Self>) -> OrchestratorResult<()> {
        let mut shutdown_slot = self.shutdown_tx.write().await;
        if shutdown_slot.is_some() {
            return Err(OrchestratorError::Internal(format!(
                "Worker {} 已在运行",
                self.settings.worker_id
            )));
        }

        info!("启动Worker: {}", self.settings.worker_id);
        let queues = self.queues();
        for queue in &queues {
            self.broker.recover_in_flight(queue).await?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = self.handles.lock().await;
        for queue in queues {
            let worker = Arc::clone(self);
            let shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                worker.partition_loop(queue, shutdown_rx).await;
            }));
        }
        let worker = Arc::clone(self);
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            worker.maintenance_loop(shutdown_rx).await;
        }));

        *shutdown_slot = Some(shutdown_tx);
        info!(
            "Worker {} 已启动，订阅 {} 个分区队列",
            self.settings.worker_id,
            handles.len() - 1
        );
        Ok(())
    }

    /// 停止拉取新任务，等待正在处理的任务结束
    pub async fn stop(&self) -> OrchestratorResult<()> {
        let Some(shutdown_tx) = self.shutdown_tx.write().await.take() else {
            return Ok(());
        };
        info!("停止Worker: {}", self.settings.worker_id);
        let _ = shutdown_tx.send(());

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker任务异常退出: {}", e);
            }
        }
        info!("Worker {} 已停止", self.settings.worker_id);
        Ok(())
    }

    async fn partition_loop(&self, queue: String, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(queue = %queue, "分区拉取循环已启动");
        loop {
            let permit = tokio::select! {
                _ = shutdown_rx.recv() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.broker.receive(&queue).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.handle_job(job).await {
                        error!(queue = %queue, "处理任务失败: {}", e);
                    }
                    drop(permit);
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = self.broker.wait_for_message(self.settings.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %queue, "拉取任务失败: {}", e);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }
        debug!(queue = %queue, "分区拉取循环已退出");
    }

    async fn maintenance_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.settings.stale_waiter_after);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    if let Err(e) = self
                        .dependencies
                        .requeue_stale_waiters(self.settings.stale_waiter_after)
                        .await
                    {
                        error!("恢复滞留等待任务失败: {}", e);
                    }
                    if let Err(e) = self.recover_stale_jobs(self.settings.stale_job_after).await {
                        error!("恢复超时任务失败: {}", e);
                    }
                    let pruned = self.monitor.prune_finished(self.settings.stale_job_after).await;
                    if pruned > 0 {
                        debug!("清理了 {} 条已结束的任务记录", pruned);
                    }
                }
            }
        }
    }
}

/// [`JobWorker`] 构建器
pub struct JobWorkerBuilder {
    settings: WorkerSettings,
    layout: PartitionLayout,
    repo: Option<Arc<dyn ItemRepository>>,
    broker: Option<Arc<dyn JobBroker>>,
    locks: Option<Arc<dyn LockStore>>,
    metrics: Option<Arc<MetricsRegistry>>,
    monitor: Option<Arc<QueueMonitor>>,
    registry: ServiceRegistry,
}

impl JobWorkerBuilder {
    pub fn new(settings: WorkerSettings) -> Self {
        Self {
            settings,
            layout: PartitionLayout::default(),
            repo: None,
            broker: None,
            locks: None,
            metrics: None,
            monitor: None,
            registry: ServiceRegistry::new(),
        }
    }

    pub fn layout(mut self, layout: PartitionLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn repository(mut self, repo: Arc<dyn ItemRepository>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn JobBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn lock_store(mut self, locks: Arc<dyn LockStore>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 与其他组件共享同一个监控器
    pub fn monitor(mut self, monitor: Arc<QueueMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> OrchestratorResult<JobWorker> {
        let repo = self
            .repo
            .ok_or_else(|| OrchestratorError::config_error("JobWorker 缺少条目仓储"))?;
        let broker = self
            .broker
            .ok_or_else(|| OrchestratorError::config_error("JobWorker 缺少消息代理"))?;
        let locks = self
            .locks
            .ok_or_else(|| OrchestratorError::config_error("JobWorker 缺少锁存储"))?;
        let metrics = self
            .metrics
            .ok_or_else(|| OrchestratorError::config_error("JobWorker 缺少指标注册表"))?;
        if self.settings.max_concurrent_jobs == 0 {
            return Err(OrchestratorError::config_error("最大并发任务数必须大于0"));
        }

        let monitor = self.monitor.unwrap_or_default();
        let dependencies = Arc::new(DependencyManager::new(
            repo.clone(),
            locks,
            broker.clone(),
            self.settings.worker_id.clone(),
            self.settings.lock_ttl,
        ));
        let producer = Arc::new(JobProducer::new(
            broker.clone(),
            monitor.clone(),
            metrics.clone(),
            self.layout,
        ));

        Ok(JobWorker {
            slots: Arc::new(Semaphore::new(self.settings.max_concurrent_jobs)),
            settings: self.settings,
            repo,
            broker,
            registry: self.registry,
            metrics,
            dependencies,
            monitor,
            producer,
            running: Mutex::new(HashMap::new()),
            shutdown_tx: RwLock::new(None),
            handles: Mutex::new(Vec::new()),
        })
    }
}
