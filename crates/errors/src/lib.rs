use thiserror::Error;

/// 编排引擎统一错误类型
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("媒体条目未找到: {id}")]
    ItemNotFound { id: i64 },
    #[error("媒体条目数据已过期: {id}")]
    StaleData { id: i64 },
    #[error("任务已取消")]
    Cancelled,
    #[error("任务执行超时")]
    ExecutionTimeout,
    #[error("无效的条目层级: {0}")]
    InvalidHierarchy(String),
    #[error("任务未找到: {id}")]
    JobNotFound { id: String },
    #[error("无效的任务状态转换: 任务 {job_id} 从 {from} 到 {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },
    #[error("服务未注册: {0}")]
    ServiceNotFound(String),
    #[error("服务 {service} 执行失败: {message}")]
    Service { service: String, message: String },
    #[error("服务 {service} 返回了无效结果: {message}")]
    InvalidResult { service: String, message: String },
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("锁服务错误: {0}")]
    Lock(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// 错误分类，调度循环与Worker据此决定吞掉、重试还是直接失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 并发删除或取消导致的预期结果，不需要重试
    Benign,
    /// 服务内部的网络/接口错误，交给重试机制
    Transient,
    /// 程序错误或配置错误，重试没有意义
    Fatal,
}

impl OrchestratorError {
    pub fn service<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Service {
            service: service.into(),
            message: message.into(),
        }
    }
    pub fn invalid_result<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::InvalidResult {
            service: service.into(),
            message: message.into(),
        }
    }
    pub fn message_queue<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }
    pub fn lock<S: Into<String>>(msg: S) -> Self {
        Self::Lock(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn item_not_found(id: i64) -> Self {
        Self::ItemNotFound { id }
    }
    pub fn job_not_found<S: Into<String>>(id: S) -> Self {
        Self::JobNotFound { id: id.into() }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::StaleData { .. }
            | OrchestratorError::ItemNotFound { .. }
            | OrchestratorError::Cancelled => ErrorClass::Benign,
            OrchestratorError::InvalidResult { .. }
            | OrchestratorError::InvalidHierarchy(_)
            | OrchestratorError::InvalidTransition { .. }
            | OrchestratorError::ServiceNotFound(_)
            | OrchestratorError::Configuration(_)
            | OrchestratorError::Serialization(_) => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }
    pub fn is_benign(&self) -> bool {
        self.class() == ErrorClass::Benign
    }
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
