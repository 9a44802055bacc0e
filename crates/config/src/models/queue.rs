use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use orchestrator_domain::{JobType, PartitionLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Memory,
    Redis,
}

/// 分区任务队列配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub redis_url: String,
    /// 任务类型 -> 分区数
    pub partitions: BTreeMap<String, u32>,
    pub max_retries: u32,
    /// 任务类型 -> 时间限制（秒）
    pub time_limits_seconds: BTreeMap<String, u64>,
    /// 锁的过期时间，需要覆盖最长的时间限制
    pub lock_ttl_seconds: u64,
    /// 等待者被视为滞留的时间
    pub stale_waiter_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let layout = PartitionLayout::default();
        Self {
            backend: QueueBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            partitions: JobType::ALL
                .iter()
                .map(|t| (t.as_str().to_string(), layout.count(*t)))
                .collect(),
            max_retries: 3,
            time_limits_seconds: JobType::ALL
                .iter()
                .map(|t| (t.as_str().to_string(), t.default_time_limit().as_secs()))
                .collect(),
            lock_ttl_seconds: 1900,
            stale_waiter_seconds: 60,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == QueueBackend::Redis && !self.redis_url.starts_with("redis://") {
            return Err(anyhow::anyhow!("Redis URL格式无效: {}", self.redis_url));
        }
        for (name, count) in &self.partitions {
            name.parse::<JobType>()
                .with_context(|| format!("分区配置中的任务类型无效: {name}"))?;
            if *count == 0 {
                return Err(anyhow::anyhow!("任务类型 {} 的分区数必须大于0", name));
            }
        }
        for (name, seconds) in &self.time_limits_seconds {
            name.parse::<JobType>()
                .with_context(|| format!("时间限制配置中的任务类型无效: {name}"))?;
            if *seconds == 0 {
                return Err(anyhow::anyhow!("任务类型 {} 的时间限制必须大于0", name));
            }
            if *seconds >= self.lock_ttl_seconds {
                return Err(anyhow::anyhow!(
                    "锁过期时间({}秒)必须大于任务类型 {} 的时间限制({}秒)",
                    self.lock_ttl_seconds,
                    name,
                    seconds
                ));
            }
        }
        if self.stale_waiter_seconds == 0 {
            return Err(anyhow::anyhow!("滞留等待阈值必须大于0"));
        }
        Ok(())
    }

    pub fn layout(&self) -> Result<PartitionLayout> {
        let mut counts = BTreeMap::new();
        for (name, count) in &self.partitions {
            counts.insert(name.parse::<JobType>()?, *count);
        }
        Ok(PartitionLayout::new(counts))
    }

    pub fn time_limit(&self, job_type: JobType) -> Duration {
        self.time_limits_seconds
            .get(job_type.as_str())
            .map(|s| Duration::from_secs(*s))
            .unwrap_or_else(|| job_type.default_time_limit())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    pub fn stale_waiter_after(&self) -> Duration {
        Duration::from_secs(self.stale_waiter_seconds)
    }
}
