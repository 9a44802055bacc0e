use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use orchestrator_domain::JobType;
use serde::{Deserialize, Serialize};

use super::{
    event_manager::EventManagerConfig, observability::ObservabilityConfig, queue::QueueConfig,
    services::HttpServiceConfig, worker::WorkerConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            url: "sqlite://orchestrator.db".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == StorageBackend::Sqlite && !self.url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!("SQLite数据库URL格式无效: {}", self.url));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub event_manager: EventManagerConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub services: Vec<HttpServiceConfig>,
}

impl AppConfig {
    /// 默认值 -> TOML文件 -> 环境变量（`ORCHESTRATOR__QUEUE__MAX_RETRIES`）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?,
        );

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/orchestrator.toml", "orchestrator.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ORCHESTRATOR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.event_manager.validate()?;
        self.queue.validate()?;
        self.storage.validate()?;
        self.worker.validate()?;
        self.observability.validate()?;

        // 超时判定必须晚于任何任务的执行上限，否则仍在执行的任务会被重复发布
        let longest = JobType::ALL
            .iter()
            .map(|job_type| self.queue.time_limit(*job_type))
            .max()
            .unwrap_or_default();
        if self.worker.stale_job_after() <= longest {
            return Err(anyhow::anyhow!(
                "worker.stale_job_seconds ({}) 必须大于最长的任务时间限制 ({}秒)",
                self.worker.stale_job_seconds,
                longest.as_secs()
            ));
        }

        let mut keys = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !keys.insert(service.key.as_str()) {
                return Err(anyhow::anyhow!("服务key重复: {}", service.key));
            }
        }
        Ok(())
    }
}
