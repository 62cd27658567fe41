use thiserror::Error;

/// 调度系统统一错误类型
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("任务未找到: {id}")]
    JobNotFound { id: i64 },
    #[error("实例未找到: {id}")]
    InstanceNotFound { id: i64 },
    #[error("Task未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("无效的触发配置: {trigger_type} - {value}")]
    InvalidTrigger { trigger_type: String, value: String },
    #[error("无效的DAG表达式: {0}")]
    InvalidDag(String),
    #[error("任务拆分失败: {0}")]
    SplitFailed(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("注册中心错误: {0}")]
    Registry(String),
    #[error("认证失败: {0}")]
    Authentication(String),
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("并发冲突: {0}")]
    Conflict(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedResult<T> = Result<T, SchedError>;

impl SchedError {
    pub fn job_not_found(id: i64) -> Self {
        Self::JobNotFound { id }
    }

    pub fn instance_not_found(id: i64) -> Self {
        Self::InstanceNotFound { id }
    }

    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn registry<S: Into<String>>(msg: S) -> Self {
        Self::Registry(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 瞬时性错误，调用方可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedError::Network(_)
                | SchedError::Registry(_)
                | SchedError::Timeout(_)
                | SchedError::Conflict(_)
        )
    }

    /// 致命错误，应当中止启动流程
    pub fn is_fatal(&self) -> bool {
        matches!(self, SchedError::Configuration(_) | SchedError::Internal(_))
    }
}

impl From<anyhow::Error> for SchedError {
    fn from(err: anyhow::Error) -> Self {
        SchedError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SchedError::network("connection refused").is_retryable());
        assert!(SchedError::conflict("version mismatch").is_retryable());
        assert!(!SchedError::job_not_found(1).is_retryable());
        assert!(!SchedError::Authentication("bad signature".to_string()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SchedError::config("missing database url").is_fatal());
        assert!(!SchedError::network("timeout").is_fatal());
    }
}
