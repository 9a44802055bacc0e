use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;

use orchestrator_config::{QueueConfig, WorkerConfig};
use orchestrator_domain::JobType;

/// Worker运行参数，由 [`WorkerConfig`] 与 [`QueueConfig`] 合成
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub job_types: Vec<JobType>,
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub time_limits: BTreeMap<JobType, Duration>,
    pub lock_ttl: Duration,
    pub stale_job_after: Duration,
    pub stale_waiter_after: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: "worker-local".to_string(),
            job_types: JobType::ALL.to_vec(),
            max_concurrent_jobs: 4,
            poll_interval: Duration::from_millis(500),
            max_retries: 3,
            time_limits: JobType::ALL
                .iter()
                .map(|job_type| (*job_type, job_type.default_time_limit()))
                .collect(),
            lock_ttl: Duration::from_secs(1900),
            stale_job_after: Duration::from_secs(3600),
            stale_waiter_after: Duration::from_secs(60),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(worker: &WorkerConfig, queue: &QueueConfig) -> Result<Self> {
        Ok(Self {
            worker_id: worker.worker_id.clone(),
            job_types: worker.job_types()?,
            max_concurrent_jobs: worker.max_concurrent_jobs,
            poll_interval: worker.poll_interval(),
            max_retries: queue.max_retries,
            time_limits: JobType::ALL
                .iter()
                .map(|job_type| (*job_type, queue.time_limit(*job_type)))
                .collect(),
            lock_ttl: queue.lock_ttl(),
            stale_job_after: worker.stale_job_after(),
            stale_waiter_after: queue.stale_waiter_after(),
        })
    }

    pub fn time_limit(&self, job_type: JobType) -> Duration {
        self.time_limits
            .get(&job_type)
            .copied()
            .unwrap_or_else(|| job_type.default_time_limit())
    }
}
