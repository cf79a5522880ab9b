use thiserror::Error;


#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("作业记录已存在: {key}")]
    DuplicateKey { key: String },
    #[error("作业记录未找到: {key}")]
    JobNotFound { key: String },
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("作业执行错误: {0}")]
    JobExecution(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn duplicate_key<S: Into<String>>(key: S) -> Self {
        Self::DuplicateKey { key: key.into() }
    }
    pub fn job_not_found<S: Into<String>>(key: S) -> Self {
        Self::JobNotFound { key: key.into() }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    /// 唯一键冲突：预约路径据此返回“已被占用”而不是传播错误
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, SchedulerError::DuplicateKey { .. })
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_) | SchedulerError::Configuration(_)
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::DatabaseOperation(_)
        )
    }
    pub fn user_message(&self) -> &str {
        match self {
            SchedulerError::DuplicateKey { .. } => "作业已被其他Worker占用",
            SchedulerError::JobNotFound { .. } => "请求的作业记录不存在",
            SchedulerError::ValidationError(_) => "输入数据验证失败",
            SchedulerError::Configuration(_) => "配置有误，请检查配置文件",
            SchedulerError::JobExecution(_) => "作业执行失败",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
