//! 任务生产者：发布任务并同步记录监控状态与指标

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use orchestrator_domain::{
    route, ItemRepository, JobBroker, JobMessage, JobType, MediaItem, MediaService,
    PartitionLayout, Route, ServiceContext,
};
use orchestrator_errors::OrchestratorResult;
use orchestrator_infrastructure::MetricsRegistry;

use crate::queue_monitor::QueueMonitor;

pub struct JobProducer {
    broker: Arc<dyn JobBroker>,
    monitor: Arc<QueueMonitor>,
    metrics: Arc<MetricsRegistry>,
    layout: PartitionLayout,
}

impl JobProducer {
    pub fn new(
        broker: Arc<dyn JobBroker>,
        monitor: Arc<QueueMonitor>,
        metrics: Arc<MetricsRegistry>,
        layout: PartitionLayout,
    ) -> Self {
        Self {
            broker,
            monitor,
            metrics,
            layout,
        }
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// 为条目创建并发布一个任务
    pub async fn enqueue(&self, job_type: JobType, item_id: i64) -> OrchestratorResult<JobMessage> {
        let job = JobMessage::new(job_type, item_id, &self.layout);
        self.publish(&job).await?;
        Ok(job)
    }

    pub async fn publish(&self, job: &JobMessage) -> OrchestratorResult<()> {
        self.monitor.register_job(job).await;
        self.broker.publish(job).await?;
        self.metrics.mark_enqueued(job);
        debug!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            item_id = job.item_id,
            partition = %job.metadata.partition,
            "任务已入队"
        );
        Ok(())
    }

    /// 以下一次尝试重新发布，分区不变
    pub async fn retry(&self, job: &JobMessage) -> OrchestratorResult<JobMessage> {
        let retry = job.next_attempt();
        self.monitor.mark_retry(&retry).await?;
        self.broker.publish(&retry).await?;
        self.metrics.mark_retry(&retry);
        Ok(retry)
    }

    /// 按路由为条目发布后续任务，容器会展开到需要处理的子节点。
    /// 已有未结束任务的（类型, 条目）不会重复发布。
    pub async fn enqueue_for_item(&self, item: &MediaItem) -> OrchestratorResult<Vec<JobMessage>> {
        let now = Utc::now();
        let mut pending = vec![item.clone()];
        let mut published = Vec::new();

        while let Some(current) = pending.pop() {
            match route(&current, now) {
                Route::Run(job_type) => {
                    if self.monitor.has_active(job_type, current.id()).await {
                        debug!("条目 {} 已有未结束的 {} 任务", current.log_string(), job_type);
                        continue;
                    }
                    published.push(self.enqueue(job_type, current.id()).await?);
                }
                Route::Expand(children) => {
                    pending.extend(
                        current
                            .children()
                            .into_iter()
                            .filter(|child| children.contains(&child.id())),
                    );
                }
                Route::Idle => {}
            }
        }
        Ok(published)
    }

    /// 扫描仓储中的未完成条目并发布任务，返回发布数量
    pub async fn enqueue_incomplete(&self, repo: &dyn ItemRepository) -> OrchestratorResult<usize> {
        let mut count = 0;
        for id in repo.incomplete_ids(Utc::now()).await? {
            if let Some(item) = repo.get(id).await? {
                count += self.enqueue_for_item(&item).await?.len();
            }
        }
        if count > 0 {
            info!("未完成条目扫描: 发布了 {} 个任务", count);
        }
        Ok(count)
    }

    /// 运行一次内容源，保存尚未入库的条目并为其发布任务。返回新条目数量。
    pub async fn ingest_source(
        &self,
        repo: &dyn ItemRepository,
        source: &dyn MediaService,
    ) -> OrchestratorResult<usize> {
        let items = source.run(None, &ServiceContext::default()).await?;
        let mut stored = 0;
        for item in items {
            if repo.get(item.id()).await?.is_some() {
                debug!("内容源 {} 的条目 {} 已存在", source.key(), item.log_string());
                continue;
            }
            if let Err(e) = item.validate() {
                warn!("内容源 {} 返回的条目无效: {}", source.key(), e);
                continue;
            }
            repo.upsert(&item).await?;
            self.enqueue_for_item(&item).await?;
            stored += 1;
        }
        if stored > 0 {
            info!("内容源 {} 新增 {} 个条目", source.key(), stored);
        }
        Ok(stored)
    }
}
