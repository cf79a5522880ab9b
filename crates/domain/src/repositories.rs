//! 领域仓储抽象
//!
//! 注册表只依赖共享记录存储提供的原子原语：插入（键存在时失败）、
//! 按键替换、按条件读取和删除。

use async_trait::async_trait;
use jobreg_errors::SchedulerResult;

use crate::entities::{JobRecord, JobStatus};
use crate::job_query::{JobFilter, JobQuery};
use crate::value_objects::JobKey;

/// 作业记录存储抽象
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 创建存储表（幂等）
    async fn ensure_schema(&self) -> SchedulerResult<()>;

    /// 写入一条记录；`replace == false` 且键已存在时返回 `SchedulerError::DuplicateKey`
    async fn insert(&self, record: &JobRecord, replace: bool) -> SchedulerResult<()>;

    /// 仅当现有记录状态属于 `expected` 时原子地整行替换，返回是否写入
    async fn replace_if_status(
        &self,
        record: &JobRecord,
        expected: &[JobStatus],
    ) -> SchedulerResult<bool>;

    /// 只更新优先级，返回记录是否存在
    async fn update_priority(&self, key: &JobKey, priority: i8) -> SchedulerResult<bool>;

    async fn fetch(&self, query: &JobQuery) -> SchedulerResult<Vec<JobRecord>>;

    /// 删除匹配的记录，返回删除数量
    async fn delete(&self, filter: &JobFilter) -> SchedulerResult<u64>;
}
