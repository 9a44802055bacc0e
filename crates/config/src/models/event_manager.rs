use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// 进程内事件调度器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventManagerConfig {
    pub poll_interval_ms: u64,
    /// 未单独配置的服务使用的线程池大小，默认串行
    pub default_pool_size: usize,
    /// 按服务 key 覆盖线程池大小
    pub pool_sizes: BTreeMap<String, usize>,
    /// 扫描未完成条目并重新提交的间隔
    pub sweep_interval_seconds: u64,
    /// 轮询内容源的间隔
    pub source_interval_seconds: u64,
}

impl Default for EventManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            default_pool_size: 1,
            pool_sizes: BTreeMap::new(),
            sweep_interval_seconds: 600,
            source_interval_seconds: 300,
        }
    }
}

impl EventManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("事件轮询间隔必须大于0"));
        }
        if self.default_pool_size == 0 {
            return Err(anyhow::anyhow!("默认线程池大小必须大于0"));
        }
        if let Some((key, _)) = self.pool_sizes.iter().find(|(_, size)| **size == 0) {
            return Err(anyhow::anyhow!("服务 {} 的线程池大小必须大于0", key));
        }
        if self.sweep_interval_seconds == 0 || self.source_interval_seconds == 0 {
            return Err(anyhow::anyhow!("扫描间隔必须大于0"));
        }
        Ok(())
    }

    pub fn pool_size(&self, service: &str) -> usize {
        self.pool_sizes
            .get(service)
            .copied()
            .unwrap_or(self.default_pool_size)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn source_interval(&self) -> Duration {
        Duration::from_secs(self.source_interval_seconds)
    }
}
