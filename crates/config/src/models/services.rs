use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use orchestrator_domain::{JobType, ServiceRole};

/// 通过HTTP接入的外部服务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpServiceConfig {
    pub key: String,
    pub role: ServiceRole,
    /// 处理器对应的任务类型，内容源留空
    #[serde(default)]
    pub job_type: String,
    pub url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl HttpServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(anyhow::anyhow!("服务key不能为空"));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(anyhow::anyhow!("服务 {} 的URL格式无效: {}", self.key, self.url));
        }
        if self.role == ServiceRole::Processor {
            self.job_type()?;
        }
        Ok(())
    }

    pub fn job_type(&self) -> Result<Option<JobType>> {
        match self.role {
            ServiceRole::Source => Ok(None),
            ServiceRole::Processor => self
                .job_type
                .parse::<JobType>()
                .map(Some)
                .with_context(|| format!("服务 {} 的任务类型无效: {}", self.key, self.job_type)),
        }
    }
}
