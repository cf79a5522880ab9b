//! 作业注册表服务
//!
//! 预约协议、对账引擎和调度查询。注册表本身不执行作业，只负责分配
//! 占用权并记录结果；所有状态都保存在共享的 [`JobStore`] 中，不做跨调用缓存。

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use jobreg_core::config::TRUNCATION_APPENDIX;
use jobreg_core::{RegistryConfig, WorkerIdentity};
use jobreg_errors::{SchedulerError, SchedulerResult};
use tracing::{debug, info, instrument, warn};

use crate::entities::{ClaimOutcome, JobRecord, JobStatus, RefreshSummary, StatusCounts};
use crate::job_query::{JobFilter, JobQuery, OrderBy};
use crate::ports::WorkSetEnumerator;
use crate::repositories::JobStore;
use crate::value_objects::{JobKey, KeyRestriction};

/// 把超长的错误信息截断到 `max_len` 个字符，并以固定后缀结尾
///
/// 长度不超过上限的信息原样返回，因此对已截断的信息再次调用不会重复追加后缀。
pub fn truncate_error_message(message: &str, max_len: usize) -> Cow<'_, str> {
    if message.chars().count() <= max_len {
        return Cow::Borrowed(message);
    }
    let keep = max_len.saturating_sub(TRUNCATION_APPENDIX.chars().count());
    let mut truncated: String = message.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_APPENDIX);
    Cow::Owned(truncated)
}

pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    config: RegistryConfig,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>, config: RegistryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// 存储精度为微秒
    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    /// 将注册表与工作集同步
    ///
    /// 已从工作集消失的键：`reserved`/`error`/`ignore` 以及 `scheduled` 记录被删除，
    /// `success` 记录作为审计留存。工作集中新出现的键以 `scheduled` 插入。
    /// 指定 `restriction` 时只处理限定范围内的记录。
    #[instrument(skip(self, work_set, restriction), fields(
        table = %self.config.table_name(),
        restriction = ?restriction.map(|r| r.to_string()),
    ))]
    pub async fn refresh(
        &self,
        work_set: &dyn WorkSetEnumerator,
        restriction: Option<&KeyRestriction>,
    ) -> SchedulerResult<RefreshSummary> {
        let mut summary = RefreshSummary::default();

        let preserved = self
            .store
            .fetch(&JobQuery::new(
                JobFilter::all()
                    .with_statuses(&JobStatus::PRESERVED)
                    .within(restriction),
            ))
            .await?;

        let enumerated = work_set.enumerate(restriction).await?;
        let available: BTreeSet<&JobKey> = enumerated.iter().collect();

        for record in preserved.iter().filter(|r| !available.contains(&r.key)) {
            summary.removed += self
                .store
                .delete(&JobFilter::key(&record.key).with_statuses(&JobStatus::PRESERVED))
                .await?;
        }

        let existing = self
            .store
            .fetch(&JobQuery::new(JobFilter::all().within(restriction)))
            .await?;

        for record in existing
            .iter()
            .filter(|r| r.status == JobStatus::Scheduled && !available.contains(&r.key))
        {
            summary.removed += self
                .store
                .delete(&JobFilter::key(&record.key).with_statuses(&[JobStatus::Scheduled]))
                .await?;
        }

        // 按工作集给出的顺序插入，时间戳严格递增以保留该顺序
        let mut seen: BTreeSet<&JobKey> = existing.iter().map(|r| &r.key).collect();
        let mut last_timestamp: Option<DateTime<Utc>> = existing.iter().map(|r| r.timestamp).max();
        for key in &enumerated {
            if !seen.insert(key) {
                continue;
            }
            let now = Self::now();
            let timestamp = match last_timestamp {
                Some(prev) if now <= prev => prev + Duration::microseconds(1),
                _ => now,
            };
            last_timestamp = Some(timestamp);

            let record = JobRecord::new(
                key.clone(),
                JobStatus::Scheduled,
                self.config.default_priority,
                timestamp,
            );
            match self.store.insert(&record, false).await {
                Ok(()) => summary.inserted += 1,
                Err(e) if e.is_duplicate_key() => {
                    debug!("作业 {} 已被并发写入，跳过", key);
                    summary.already_present += 1;
                }
                Err(e) => return Err(e),
            }
        }

        metrics::counter!("jobreg_refresh_inserted_total").increment(summary.inserted);
        metrics::counter!("jobreg_refresh_removed_total").increment(summary.removed);
        info!(
            "注册表对账完成: 新增 {} 个, 移除 {} 个, 工作集共 {} 个",
            summary.inserted,
            summary.removed,
            available.len()
        );
        Ok(summary)
    }

    /// 返回可被占用的作业键，默认按优先级、时间戳升序；`limit` 为 0 表示不限制
    pub async fn get_claimable(
        &self,
        limit: Option<usize>,
        order_by: Option<&[OrderBy]>,
    ) -> SchedulerResult<Vec<JobKey>> {
        self.get_claimable_within(None, limit, order_by).await
    }

    /// 只返回 `restriction` 范围内可被占用的作业键
    #[instrument(skip(self, restriction, order_by), fields(
        restriction = ?restriction.map(|r| r.to_string()),
    ))]
    pub async fn get_claimable_within(
        &self,
        restriction: Option<&KeyRestriction>,
        limit: Option<usize>,
        order_by: Option<&[OrderBy]>,
    ) -> SchedulerResult<Vec<JobKey>> {
        let query = JobQuery::new(JobFilter::status(JobStatus::Scheduled).within(restriction))
            .order_by(order_by.unwrap_or(&[]))
            .limit(limit.filter(|&n| n > 0));
        let keys: Vec<JobKey> = self
            .store
            .fetch(&query)
            .await?
            .into_iter()
            .map(|r| r.key)
            .collect();
        debug!("查询到 {} 个可调度作业", keys.len());
        Ok(keys)
    }

    /// 独占地预约一个作业
    #[instrument(skip(self, worker), fields(job_key = %key, worker = %worker.describe()))]
    pub async fn reserve(&self, key: &JobKey, worker: &WorkerIdentity) -> SchedulerResult<ClaimOutcome> {
        self.claim(key, worker, JobStatus::Reserved, &[JobStatus::Scheduled])
            .await
    }

    /// 永久排除一个作业，不再调度；出错的作业也可以被忽略
    #[instrument(skip(self, worker), fields(job_key = %key, worker = %worker.describe()))]
    pub async fn ignore(&self, key: &JobKey, worker: &WorkerIdentity) -> SchedulerResult<ClaimOutcome> {
        self.claim(
            key,
            worker,
            JobStatus::Ignore,
            &[JobStatus::Scheduled, JobStatus::Error],
        )
        .await
    }

    /// 先尝试插入；键已存在时仅在状态属于 `takeover_from` 时替换
    async fn claim(
        &self,
        key: &JobKey,
        worker: &WorkerIdentity,
        status: JobStatus,
        takeover_from: &[JobStatus],
    ) -> SchedulerResult<ClaimOutcome> {
        key.validate()?;
        let record = JobRecord::new(key.clone(), status, self.config.default_priority, Self::now())
            .with_worker(worker);

        let outcome = match self.store.insert(&record, false).await {
            Ok(()) => ClaimOutcome::Claimed,
            Err(e) if e.is_duplicate_key() => {
                if self.store.replace_if_status(&record, takeover_from).await? {
                    ClaimOutcome::Claimed
                } else {
                    ClaimOutcome::AlreadyTaken
                }
            }
            Err(e) => return Err(e),
        };

        match outcome {
            ClaimOutcome::Claimed => {
                info!("作业 {} 已标记为 {}", key, status);
                metrics::counter!("jobreg_reservations_total", "status" => status.as_str(), "outcome" => "claimed")
                    .increment(1);
            }
            ClaimOutcome::AlreadyTaken => {
                warn!("作业 {} 已被占用，无法标记为 {}", key, status);
                metrics::counter!("jobreg_reservations_total", "status" => status.as_str(), "outcome" => "already_taken")
                    .increment(1);
            }
        }
        Ok(outcome)
    }

    /// 记录作业成功完成；总是覆盖写入
    #[instrument(skip(self, worker, run_version), fields(job_key = %key))]
    pub async fn complete(
        &self,
        key: &JobKey,
        worker: &WorkerIdentity,
        run_duration: Option<f64>,
        run_version: Option<&serde_json::Value>,
    ) -> SchedulerResult<()> {
        key.validate()?;
        if let Some(duration) = run_duration {
            if !duration.is_finite() || duration < 0.0 {
                return Err(SchedulerError::validation_error(format!(
                    "运行时长必须是非负数: {duration}"
                )));
            }
        }

        let mut record = JobRecord::new(
            key.clone(),
            JobStatus::Success,
            self.config.default_priority,
            Self::now(),
        )
        .with_worker(worker);
        record.run_duration = run_duration;
        record.run_version = run_version.cloned();

        self.store.insert(&record, true).await?;
        metrics::counter!("jobreg_outcomes_total", "status" => "success").increment(1);
        info!("作业 {} 执行成功", key);
        Ok(())
    }

    /// 记录作业失败；超长信息被确定性地截断
    #[instrument(skip(self, worker, message, stack), fields(job_key = %key))]
    pub async fn error(
        &self,
        key: &JobKey,
        worker: &WorkerIdentity,
        message: &str,
        stack: Option<&str>,
    ) -> SchedulerResult<()> {
        key.validate()?;
        let max_len = self.config.error_message_max_length;
        let message = truncate_error_message(message, max_len);
        if matches!(message, Cow::Owned(_)) {
            warn!("作业 {} 的错误信息超过 {} 个字符，已截断", key, max_len);
            metrics::counter!("jobreg_error_messages_truncated_total").increment(1);
        }

        let mut record = JobRecord::new(
            key.clone(),
            JobStatus::Error,
            self.config.default_priority,
            Self::now(),
        )
        .with_worker(worker);
        record.error_message = message.into_owned();
        record.error_stack = stack.map(str::to_string);

        self.store.insert(&record, true).await?;
        metrics::counter!("jobreg_outcomes_total", "status" => "error").increment(1);
        info!("作业 {} 执行失败: {}", key, record.error_message);
        Ok(())
    }

    /// 只修改优先级，不改变状态
    #[instrument(skip(self), fields(job_key = %key))]
    pub async fn set_priority(&self, key: &JobKey, priority: i8) -> SchedulerResult<()> {
        if !self.store.update_priority(key, priority).await? {
            return Err(SchedulerError::job_not_found(key.canonical()));
        }
        info!("作业 {} 优先级更新为 {}", key, priority);
        Ok(())
    }

    pub async fn fetch(&self, key: &JobKey) -> SchedulerResult<Option<JobRecord>> {
        let mut records = self
            .store
            .fetch(&JobQuery::new(JobFilter::key(key)).limit(Some(1)))
            .await?;
        Ok(records.pop())
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: Option<usize>,
    ) -> SchedulerResult<Vec<JobRecord>> {
        let filter = match status {
            Some(status) => JobFilter::status(status),
            None => JobFilter::all(),
        };
        self.store.fetch(&JobQuery::new(filter).limit(limit)).await
    }

    /// 手动清理一条记录（包括卡住的预约），返回是否存在
    #[instrument(skip(self), fields(job_key = %key))]
    pub async fn delete(&self, key: &JobKey) -> SchedulerResult<bool> {
        let deleted = self.store.delete(&JobFilter::key(key)).await?;
        if deleted > 0 {
            info!("已删除作业 {}", key);
        }
        Ok(deleted > 0)
    }

    /// 上游工作项被删除时由其调用，级联删除对应的作业记录
    #[instrument(skip(self, restriction), fields(restriction = %restriction))]
    pub async fn purge_for_parent(&self, restriction: &KeyRestriction) -> SchedulerResult<u64> {
        let deleted = self
            .store
            .delete(&JobFilter::all().within(Some(restriction)))
            .await?;
        info!("上游工作项 {} 已删除，级联移除 {} 条作业记录", restriction, deleted);
        Ok(deleted)
    }

    /// 时间戳早于 `cutoff` 的预约；注册表不会自动回收，恢复由运维显式操作
    pub async fn stuck_reservations(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<JobRecord>> {
        self.store
            .fetch(&JobQuery::new(
                JobFilter::status(JobStatus::Reserved).older_than(cutoff),
            ))
            .await
    }

    pub async fn status_counts(&self) -> SchedulerResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for record in self.store.fetch(&JobQuery::new(JobFilter::all())).await? {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_is_untouched() {
        let message = truncate_error_message("boom", 2047);
        assert!(matches!(message, Cow::Borrowed("boom")));
    }

    #[test]
    fn test_long_message_is_truncated_to_cap() {
        let long = "x".repeat(5000);
        let message = truncate_error_message(&long, 2047);
        assert_eq!(message.chars().count(), 2047);
        assert!(message.ends_with(TRUNCATION_APPENDIX));
        assert!(message.starts_with("xxxx"));
    }

    #[test]
    fn test_truncation_is_idempotent() {
        let long = "y".repeat(3000);
        let once = truncate_error_message(&long, 2047).into_owned();
        let twice = truncate_error_message(&once, 2047);
        assert_eq!(twice, once);
        assert_eq!(twice.matches(TRUNCATION_APPENDIX).count(), 1);
    }

    #[test]
    fn test_truncation_counts_characters_not_bytes() {
        let long = "错".repeat(30);
        let message = truncate_error_message(&long, 20);
        assert_eq!(message.chars().count(), 20);
        assert!(message.ends_with(TRUNCATION_APPENDIX));
    }

    #[test]
    fn test_message_exactly_at_cap_is_kept() {
        let exact = "z".repeat(2047);
        assert_eq!(truncate_error_message(&exact, 2047), exact.as_str());
    }
}
