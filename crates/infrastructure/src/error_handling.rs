//! Enhanced error handling for job store operations with rich context
//!
//! 为作业存储的每个操作提供带上下文的错误构造和结构化日志。

use chrono::{DateTime, Utc};
use jobreg_domain::{JobKey, JobStatus};
use jobreg_errors::SchedulerError;
use sqlx::Error as SqlxError;
use std::fmt;
use tracing::{debug, error, instrument};

/// Operation context for repository operations
#[derive(Debug, Clone, Copy)]
pub enum RepositoryOperation {
    Create,
    Replace,
    ConditionalReplace,
    Update,
    Delete,
    Query,
    Migrate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Replace => write!(f, "替换"),
            RepositoryOperation::ConditionalReplace => write!(f, "条件替换"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Query => write!(f, "查询"),
            RepositoryOperation::Migrate => write!(f, "初始化"),
        }
    }
}

/// Context information for job store operations
#[derive(Debug, Clone)]
pub struct JobOperationContext {
    pub operation: RepositoryOperation,
    pub table: String,
    pub job_key: Option<String>,
    pub status: Option<JobStatus>,
    pub timestamp: DateTime<Utc>,
    pub additional_info: Option<String>,
}

impl JobOperationContext {
    pub fn new(operation: RepositoryOperation, table: &str) -> Self {
        Self {
            operation,
            table: table.to_string(),
            job_key: None,
            status: None,
            timestamp: Utc::now(),
            additional_info: None,
        }
    }

    pub fn with_job_key(mut self, key: &JobKey) -> Self {
        self.job_key = Some(key.canonical());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_additional_info(mut self, info: String) -> Self {
        self.additional_info = Some(info);
        self
    }

    pub fn entity_description(&self) -> String {
        match &self.job_key {
            Some(key) => format!("{} 中的作业 {}", self.table, key),
            None => format!("作业表 {}", self.table),
        }
    }
}

/// Enhanced error helpers for repository operations
pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    /// 把数据库错误转换为领域错误；唯一约束冲突单独映射为 `DuplicateKey`
    #[instrument(skip_all, fields(
        operation = %context.operation,
        table = %context.table,
        job_key = ?context.job_key,
        status = ?context.status,
    ))]
    pub fn job_database_error(context: JobOperationContext, error: SqlxError) -> SchedulerError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation.to_string();

        let error_msg = match &error {
            SqlxError::Database(db_error) => {
                if db_error.is_unique_violation() {
                    let key = context.job_key.clone().unwrap_or_default();
                    debug!("{}{}时发生唯一约束冲突: 作业键 {} 已存在", operation_desc, entity_desc, key);
                    return SchedulerError::duplicate_key(key);
                }
                format!("{}{}时发生数据库错误: {}", operation_desc, entity_desc, db_error)
            }
            SqlxError::PoolClosed => {
                format!("{}{}时数据库连接池已关闭", operation_desc, entity_desc)
            }
            SqlxError::PoolTimedOut => {
                format!("{}{}时数据库连接池超时", operation_desc, entity_desc)
            }
            SqlxError::Io(io_error) => {
                format!("{}{}时发生I/O错误: {}", operation_desc, entity_desc, io_error)
            }
            _ => {
                format!("{}{}时发生未知数据库错误: {}", operation_desc, entity_desc, error)
            }
        };

        error!(error = %error, "{}", error_msg);
        SchedulerError::database_error(error_msg)
    }

    /// 存储中的数据无法还原为领域对象
    pub fn job_decode_error(context: JobOperationContext, error: impl fmt::Display) -> SchedulerError {
        let error_msg = format!(
            "{}{}时解析记录失败: {}",
            context.operation,
            context.entity_description(),
            error
        );
        error!("{}", error_msg);
        SchedulerError::Serialization(error_msg)
    }

    pub fn job_serialization_error(context: JobOperationContext, error: impl fmt::Display) -> SchedulerError {
        let error_msg = format!(
            "{}{}时序列化失败: {}",
            context.operation,
            context.entity_description(),
            error
        );
        error!("{}", error_msg);
        SchedulerError::Serialization(error_msg)
    }

    pub fn log_operation_success(context: &JobOperationContext, additional_info: Option<&str>) {
        let base_msg = format!("{}{}成功", context.operation, context.entity_description());
        match additional_info {
            Some(info) => debug!("{}: {}", base_msg, info),
            None => debug!("{}", base_msg),
        }
    }
}

/// Macro for creating job operation context easily
#[macro_export]
macro_rules! job_context {
    ($operation:expr, $table:expr) => {
        $crate::error_handling::JobOperationContext::new($operation, $table)
    };
    ($operation:expr, $table:expr, key = $key:expr) => {
        $crate::error_handling::JobOperationContext::new($operation, $table).with_job_key($key)
    };
    ($operation:expr, $table:expr, key = $key:expr, status = $status:expr) => {
        $crate::error_handling::JobOperationContext::new($operation, $table)
            .with_job_key($key)
            .with_status($status)
    };
}
