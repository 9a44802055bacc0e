//! 显式重载的配置句柄
//!
//! 配置变化不会自动通知任何组件，由编排器在需要时调用 [`ConfigHandle::reload`]，
//! 再把新配置传给各组件的 `reload`。

use std::sync::{Arc, RwLock};

use anyhow::Result;
use tracing::info;

use crate::AppConfig;

#[derive(Debug, Clone)]
pub struct ConfigHandle {
    path: Option<String>,
    current: Arc<RwLock<Arc<AppConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: AppConfig, path: Option<String>) -> Self {
        Self {
            path,
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn load(path: Option<&str>) -> Result<Self> {
        let config = AppConfig::load(path)?;
        Ok(Self::new(config, path.map(str::to_string)))
    }

    pub fn current(&self) -> Arc<AppConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 重新加载配置；校验失败时保留旧配置并返回错误
    pub fn reload(&self) -> Result<Arc<AppConfig>> {
        let config = Arc::new(AppConfig::load(self.path.as_deref())?);
        match self.current.write() {
            Ok(mut guard) => *guard = config.clone(),
            Err(poisoned) => *poisoned.into_inner() = config.clone(),
        }
        info!("配置已重新加载: {:?}", self.path);
        Ok(config)
    }
}
