//! 服务契约
//!
//! 外部协作方（内容源、刮削器、下载、放置等）通过 [`MediaService`] 接入编排核心。
//! 核心只关心三件事：服务的 key（用于线程池与指标标签）、`initialized` 开关、`run` 入口。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use orchestrator_errors::{OrchestratorError, OrchestratorResult};

use crate::item::MediaItem;
use crate::jobs::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    /// 处理已有条目，推进其状态
    Processor,
    /// 不接收条目，产出新的候选条目
    Source,
}

/// 一次服务调用的上下文
#[derive(Debug, Clone, Default)]
pub struct ServiceContext {
    /// 建议性取消：服务应在合适的检查点停止后续副作用，但已发生的副作用不会回滚
    pub cancel: CancellationToken,
    pub attempt: u32,
}

impl ServiceContext {
    pub fn new(cancel: CancellationToken, attempt: u32) -> Self {
        Self { cancel, attempt }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn ensure_not_cancelled(&self) -> OrchestratorResult<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
pub trait MediaService: Send + Sync {
    fn key(&self) -> &str;

    /// 处理器对应的任务类型；内容源返回 `None`
    fn job_type(&self) -> Option<JobType>;

    fn role(&self) -> ServiceRole {
        ServiceRole::Processor
    }

    fn initialized(&self) -> bool {
        true
    }

    async fn run(
        &self,
        item: Option<MediaItem>,
        ctx: &ServiceContext,
    ) -> OrchestratorResult<Vec<MediaItem>>;
}

/// 服务注册表：按 key 查找服务，按任务类型路由到处理器
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn MediaService>>,
    routes: HashMap<JobType, String>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn MediaService>) {
        let key = service.key().to_string();
        if let (ServiceRole::Processor, Some(job_type)) = (service.role(), service.job_type()) {
            self.routes.insert(job_type, key.clone());
        }
        self.services.insert(key, service);
    }

    pub fn with(mut self, service: Arc<dyn MediaService>) -> Self {
        self.register(service);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn MediaService>> {
        self.services.get(key).cloned()
    }

    pub fn for_job(&self, job_type: JobType) -> Option<Arc<dyn MediaService>> {
        self.routes
            .get(&job_type)
            .and_then(|key| self.services.get(key))
            .cloned()
    }

    pub fn require_for_job(&self, job_type: JobType) -> OrchestratorResult<Arc<dyn MediaService>> {
        self.for_job(job_type)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(job_type.to_string()))
    }

    pub fn sources(&self) -> Vec<Arc<dyn MediaService>> {
        let mut sources: Vec<_> = self
            .services
            .values()
            .filter(|s| s.role() == ServiceRole::Source)
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.key().cmp(b.key()));
        sources
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.services.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        key: &'static str,
        job_type: Option<JobType>,
        role: ServiceRole,
    }

    #[async_trait]
    impl MediaService for Fixed {
        fn key(&self) -> &str {
            self.key
        }
        fn job_type(&self) -> Option<JobType> {
            self.job_type
        }
        fn role(&self) -> ServiceRole {
            self.role
        }
        async fn run(
            &self,
            item: Option<MediaItem>,
            _ctx: &ServiceContext,
        ) -> OrchestratorResult<Vec<MediaItem>> {
            Ok(item.into_iter().collect())
        }
    }

    #[test]
    fn test_registry_routes_processors_by_job_type() {
        let registry = ServiceRegistry::new()
            .with(Arc::new(Fixed {
                key: "scraper",
                job_type: Some(JobType::Scrape),
                role: ServiceRole::Processor,
            }))
            .with(Arc::new(Fixed {
                key: "watchlist",
                job_type: None,
                role: ServiceRole::Source,
            }));

        assert_eq!(registry.for_job(JobType::Scrape).unwrap().key(), "scraper");
        assert!(registry.for_job(JobType::Download).is_none());
        assert!(matches!(
            registry.require_for_job(JobType::Download),
            Err(OrchestratorError::ServiceNotFound(_))
        ));
        assert_eq!(registry.sources().len(), 1);
        assert_eq!(registry.keys(), vec!["scraper", "watchlist"]);
    }

    #[test]
    fn test_context_cancellation() {
        let ctx = ServiceContext::default();
        assert!(ctx.ensure_not_cancelled().is_ok());
        ctx.cancel.cancel();
        assert!(matches!(
            ctx.ensure_not_cancelled(),
            Err(OrchestratorError::Cancelled)
        ));
    }
}
