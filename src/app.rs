use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_config::{AppConfig, QueueBackend, StorageBackend};
use orchestrator_dispatcher::EventManager;
use orchestrator_domain::{ItemRepository, JobBroker, LockStore, ServiceRegistry};
use orchestrator_infrastructure::{
    HttpMediaService, InMemoryItemRepository, InMemoryJobBroker, InMemoryLockStore,
    MetricsRegistry, RedisJobBroker, RedisLockStore, SqliteItemRepository,
};
use orchestrator_worker::{JobWorker, WorkerSettings};
use tokio::{sync::broadcast, task::JoinHandle, time};
use tracing::{error, info, warn};

use crate::http::{self, HttpState};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 进程内事件管理器：内容源轮询、未完成条目扫描与服务调用都在本进程
    Events,
    /// 仅消费分区队列
    Worker,
    /// 消费分区队列，同时负责扫描未完成条目和轮询内容源
    All,
}

impl AppMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppMode::Events => "events",
            AppMode::Worker => "worker",
            AppMode::All => "all",
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "events" => Ok(AppMode::Events),
            "worker" => Ok(AppMode::Worker),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

/// 按配置创建的协作组件
#[derive(Clone)]
pub struct Components {
    pub repo: Arc<dyn ItemRepository>,
    pub broker: Arc<dyn JobBroker>,
    pub locks: Arc<dyn LockStore>,
    pub registry: ServiceRegistry,
}

impl Components {
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let repo: Arc<dyn ItemRepository> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(InMemoryItemRepository::new()),
            StorageBackend::Sqlite => Arc::new(
                SqliteItemRepository::connect(&config.storage.url)
                    .await
                    .with_context(|| format!("连接SQLite失败: {}", config.storage.url))?,
            ),
        };

        let (broker, locks): (Arc<dyn JobBroker>, Arc<dyn LockStore>) = match config.queue.backend
        {
            QueueBackend::Memory => (
                Arc::new(InMemoryJobBroker::new()),
                Arc::new(InMemoryLockStore::new()),
            ),
            QueueBackend::Redis => (
                Arc::new(
                    RedisJobBroker::connect(&config.queue.redis_url)
                        .await
                        .context("连接Redis消息队列失败")?,
                ),
                Arc::new(
                    RedisLockStore::connect(&config.queue.redis_url)
                        .await
                        .context("连接Redis锁存储失败")?,
                ),
            ),
        };

        let mut registry = ServiceRegistry::new();
        for service in &config.services {
            let adapter = HttpMediaService::from_config(service)
                .with_context(|| format!("创建服务 {} 失败", service.key))?;
            registry.register(Arc::new(adapter));
        }
        info!("已注册服务: {:?}", registry.keys());

        Ok(Self {
            repo,
            broker,
            locks,
            registry,
        })
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    components: Components,
    metrics: Arc<MetricsRegistry>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {}", mode);
        let components = Components::from_config(&config).await?;
        Self::with_components(config, mode, components)
    }

    pub fn with_components(config: AppConfig, mode: AppMode, components: Components) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(
            MetricsRegistry::new(config.observability.latency_capacity)
                .context("创建指标注册表失败")?,
        );
        Ok(Self {
            config,
            mode,
            components,
            metrics,
        })
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {}", self.mode);

        match self.mode {
            AppMode::Events => self.run_events(shutdown_rx).await,
            AppMode::Worker => self.run_distributed(shutdown_rx, false).await,
            AppMode::All => self.run_distributed(shutdown_rx, true).await,
        }
    }

    async fn run_events(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let events = Arc::new(EventManager::new(
            self.components.repo.clone(),
            self.components.registry.clone(),
            self.config.event_manager.clone(),
        ));

        let http = self.spawn_http(
            HttpState::new(self.mode.as_str(), self.metrics.clone()).with_events(events.clone()),
            shutdown_rx.resubscribe(),
        );

        let result = events.run(shutdown_rx).await;
        join_http(http).await;
        result.context("事件管理器运行失败")
    }

    async fn run_distributed(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
        produce: bool,
    ) -> Result<()> {
        let settings = WorkerSettings::from_config(&self.config.worker, &self.config.queue)?;
        let worker = Arc::new(
            JobWorker::builder(settings)
                .layout(self.config.queue.layout()?)
                .repository(self.components.repo.clone())
                .broker(self.components.broker.clone())
                .lock_store(self.components.locks.clone())
                .metrics(self.metrics.clone())
                .registry(self.components.registry.clone())
                .build()
                .context("创建Worker失败")?,
        );
        worker.start().await.context("启动Worker失败")?;

        let http = self.spawn_http(
            HttpState::new(self.mode.as_str(), self.metrics.clone())
                .with_monitor(worker.monitor().clone()),
            shutdown_rx.resubscribe(),
        );

        if produce {
            self.produce(&worker, &mut shutdown_rx).await;
        } else {
            let _ = shutdown_rx.recv().await;
        }

        info!("停止Worker: {}", worker.worker_id());
        let result = worker.stop().await;
        join_http(http).await;
        result.context("停止Worker失败")
    }

    /// 周期性扫描未完成条目、轮询内容源，直到收到关闭信号
    async fn produce(&self, worker: &Arc<JobWorker>, shutdown_rx: &mut broadcast::Receiver<()>) {
        let producer = worker.producer().clone();
        let mut sweep = time::interval(self.config.event_manager.sweep_interval());
        let mut sources = time::interval(self.config.event_manager.source_interval());

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("生产者收到关闭信号");
                    break;
                }
                _ = sweep.tick() => {
                    if let Err(e) = producer.enqueue_incomplete(self.components.repo.as_ref()).await {
                        warn!("未完成条目扫描失败: {}", e);
                    }
                }
                _ = sources.tick() => {
                    for source in self.components.registry.sources() {
                        if !source.initialized() {
                            continue;
                        }
                        if let Err(e) = producer
                            .ingest_source(self.components.repo.as_ref(), source.as_ref())
                            .await
                        {
                            error!("轮询内容源 {} 失败: {}", source.key(), e);
                        }
                    }
                }
            }
        }
    }

    fn spawn_http(
        &self,
        state: HttpState,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        if !self.config.observability.metrics_enabled {
            return None;
        }
        let bind_address = self.config.observability.bind_address.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = http::serve(&bind_address, state, shutdown_rx).await {
                error!("HTTP端点运行失败: {:#}", e);
            }
        }))
    }
}

async fn join_http(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            error!("HTTP端点任务异常退出: {}", e);
        }
    }
}
