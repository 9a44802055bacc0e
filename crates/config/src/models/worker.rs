use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use orchestrator_domain::JobType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// 订阅的任务类型
    pub job_types: Vec<String>,
    pub max_concurrent_jobs: usize,
    pub poll_interval_ms: u64,
    /// RUNNING 超过该时间的任务在恢复时重新入队
    pub stale_job_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            worker_id: format!("worker-{host}"),
            job_types: JobType::ALL.iter().map(|t| t.as_str().to_string()).collect(),
            max_concurrent_jobs: 4,
            poll_interval_ms: 500,
            stale_job_seconds: 3600,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }
        if self.job_types.is_empty() {
            return Err(anyhow::anyhow!("Worker至少需要订阅一种任务类型"));
        }
        self.job_types()?;
        Ok(())
    }

    pub fn job_types(&self) -> Result<Vec<JobType>> {
        self.job_types
            .iter()
            .map(|t| {
                t.parse::<JobType>()
                    .with_context(|| format!("Worker订阅的任务类型无效: {t}"))
            })
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_job_after(&self) -> Duration {
        Duration::from_secs(self.stale_job_seconds)
    }
}
