use thiserror::Error;

/// 队列子系统统一错误类型
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("参数验证失败: {0}")]
    Validation(String),
    #[error("任务不存在: id={id}")]
    TaskNotFound { id: String },
    #[error("任务类型 {task_type} 没有注册处理器")]
    HandlerNotFound { task_type: String },
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("存储操作失败: {0}")]
    Store(String),
    #[error("任务声明已丢失: id={id}")]
    ClaimLost { id: String },
    #[error("数据序列化错误: {0}")]
    Serialization(String),
    #[error("系统内部错误: {0}")]
    Internal(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    pub fn store_error<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn claim_lost<S: Into<String>>(id: S) -> Self {
        Self::ClaimLost { id: id.into() }
    }

    /// 只有存储不可达值得结算方原地重试；其余错误重试也不会变好
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Store(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Configuration(_) | QueueError::Internal(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Internal(err.to_string())
    }
}
