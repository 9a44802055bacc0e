use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use orchestrator_domain::{DeadLetter, JobBroker, JobMessage};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    /// 单个队列最大容量（0表示无限制）
    pub max_queue_size: usize,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<JobMessage>>,
    /// 已取出未确认：job_id -> (队列名, 消息)
    in_flight: HashMap<String, (String, JobMessage)>,
    dead_letters: Vec<DeadLetter>,
}

/// 内存消息代理
///
/// 每个分区队列一个FIFO，发布时唤醒等待者。适用于单进程部署和测试。
pub struct InMemoryJobBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    config: InMemoryBrokerConfig,
}

impl Default for InMemoryJobBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobBroker {
    pub fn new() -> Self {
        Self::with_config(InMemoryBrokerConfig::default())
    }

    pub fn with_config(config: InMemoryBrokerConfig) -> Self {
        info!("Creating in-memory job broker with config: {:?}", config);
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            config,
        }
    }

    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl JobBroker for InMemoryJobBroker {
    async fn publish(&self, job: &JobMessage) -> OrchestratorResult<()> {
        let queue_name = job.queue_name();
        {
            let mut state = self.state.lock().await;
            let queue = state.queues.entry(queue_name.clone()).or_default();
            if self.config.max_queue_size > 0 && queue.len() >= self.config.max_queue_size {
                warn!("队列已满: {}", queue_name);
                return Err(OrchestratorError::message_queue(format!(
                    "Queue {queue_name} is full"
                )));
            }
            queue.push_back(job.clone());
        }
        debug!(
            job_id = %job.job_id,
            queue = %queue_name,
            attempt = job.metadata.attempt,
            "任务已发布"
        );
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str) -> OrchestratorResult<Option<JobMessage>> {
        let mut state = self.state.lock().await;
        let job = state.queues.get_mut(queue).and_then(VecDeque::pop_front);
        if let Some(job) = &job {
            state
                .in_flight
                .insert(job.job_id.clone(), (queue.to_string(), job.clone()));
        }
        Ok(job)
    }

    async fn ack(&self, job: &JobMessage) -> OrchestratorResult<()> {
        self.state.lock().await.in_flight.remove(&job.job_id);
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> OrchestratorResult<u64> {
        let state = self.state.lock().await;
        Ok(state.queues.get(queue).map_or(0, |q| q.len() as u64))
    }

    async fn dead_letter(&self, job: &JobMessage, reason: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&job.job_id);
        state.dead_letters.push(DeadLetter {
            job: job.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self) -> OrchestratorResult<Vec<DeadLetter>> {
        Ok(self.state.lock().await.dead_letters.clone())
    }

    async fn take_dead_letters(&self) -> OrchestratorResult<Vec<DeadLetter>> {
        Ok(std::mem::take(&mut self.state.lock().await.dead_letters))
    }

    async fn wait_for_message(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    async fn recover_in_flight(&self, queue: &str) -> OrchestratorResult<usize> {
        let mut state = self.state.lock().await;
        let mut recovered: Vec<JobMessage> = Vec::new();
        state.in_flight.retain(|_, (name, job)| {
            if name == queue {
                recovered.push(job.clone());
                false
            } else {
                true
            }
        });
        recovered.sort_by_key(|job| job.enqueued_at);
        let count = recovered.len();
        let target = state.queues.entry(queue.to_string()).or_default();
        for job in recovered.into_iter().rev() {
            target.push_front(job);
        }
        if count > 0 {
            info!("恢复了 {} 个未确认的任务到队列 {}", count, queue);
        }
        Ok(count)
    }
}
