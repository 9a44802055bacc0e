use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orchestrator_errors::OrchestratorResult;

use crate::jobs::JobMessage;

/// 死信记录：任务本身加上最后一次失败的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: JobMessage,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// 分区任务队列的消息代理
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// 发布到 `job.queue_name()`
    async fn publish(&self, job: &JobMessage) -> OrchestratorResult<()>;

    /// 非阻塞地取出一条消息，队列为空时返回 `None`
    async fn receive(&self, queue: &str) -> OrchestratorResult<Option<JobMessage>>;

    async fn ack(&self, job: &JobMessage) -> OrchestratorResult<()>;

    async fn queue_size(&self, queue: &str) -> OrchestratorResult<u64>;

    async fn dead_letter(&self, job: &JobMessage, reason: &str) -> OrchestratorResult<()>;

    async fn dead_letters(&self) -> OrchestratorResult<Vec<DeadLetter>>;

    async fn take_dead_letters(&self) -> OrchestratorResult<Vec<DeadLetter>>;

    /// 等待有新消息发布或超时，避免空轮询
    async fn wait_for_message(&self, timeout: Duration);

    /// 把崩溃前已取出但未确认的消息放回队列
    async fn recover_in_flight(&self, _queue: &str) -> OrchestratorResult<usize> {
        Ok(0)
    }
}
