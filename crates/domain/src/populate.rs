//! 自动填充驱动
//!
//! 反复执行：对账注册表 → 取候选作业 → 预约 → 计算 → 上报结果。
//! 被其他Worker抢先占用的作业直接跳过。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use jobreg_core::WorkerIdentity;
use jobreg_errors::{SchedulerError, SchedulerResult};
use tracing::{error, info, instrument};

use crate::entities::ClaimOutcome;
use crate::job_query::OrderBy;
use crate::ports::WorkSetEnumerator;
use crate::services::JobRegistry;
use crate::value_objects::{JobKey, KeyRestriction};

/// 针对单个作业键的计算
#[async_trait]
pub trait MakeJob: Send + Sync {
    async fn make(&self, key: &JobKey) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PopulateOptions {
    /// 开始前先与工作集对账
    pub refresh_jobs: bool,
    /// 只对账并执行该范围内的作业
    pub restriction: Option<KeyRestriction>,
    /// 本轮最多取出的候选作业数量
    pub limit: Option<usize>,
    /// 本轮最多执行的计算次数
    pub max_calls: Option<usize>,
    /// 为空时按默认调度顺序
    pub order_by: Vec<OrderBy>,
    /// 为 true 时记录错误并继续，否则在第一个错误处返回
    pub suppress_errors: bool,
    pub run_version: Option<serde_json::Value>,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            refresh_jobs: true,
            restriction: None,
            limit: None,
            max_calls: None,
            order_by: Vec::new(),
            suppress_errors: false,
            run_version: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PopulateReport {
    pub success_count: usize,
    /// 预约失败（已被占用）而跳过的作业
    pub skipped: usize,
    pub errors: Vec<(JobKey, String)>,
}

pub struct Populator {
    registry: Arc<JobRegistry>,
    worker: WorkerIdentity,
}

impl Populator {
    pub fn new(registry: Arc<JobRegistry>, worker: WorkerIdentity) -> Self {
        Self { registry, worker }
    }

    #[instrument(skip_all, fields(table = %self.registry.config().table_name(), worker = %self.worker.describe()))]
    pub async fn populate(
        &self,
        work_set: &dyn WorkSetEnumerator,
        make: &dyn MakeJob,
        options: &PopulateOptions,
    ) -> SchedulerResult<PopulateReport> {
        let restriction = options.restriction.as_ref();
        if options.refresh_jobs {
            self.registry.refresh(work_set, restriction).await?;
        }

        let order = (!options.order_by.is_empty()).then_some(options.order_by.as_slice());
        let keys = self
            .registry
            .get_claimable_within(restriction, options.limit, order)
            .await?;
        info!("本轮共有 {} 个候选作业", keys.len());

        let mut report = PopulateReport::default();
        let mut calls = 0usize;

        for key in keys {
            if options.max_calls.is_some_and(|max| calls >= max) {
                break;
            }
            if self.registry.reserve(&key, &self.worker).await? == ClaimOutcome::AlreadyTaken {
                report.skipped += 1;
                continue;
            }
            calls += 1;

            let started = Instant::now();
            match make.make(&key).await {
                Ok(()) => {
                    let duration = started.elapsed().as_secs_f64();
                    self.registry
                        .complete(&key, &self.worker, Some(duration), options.run_version.as_ref())
                        .await?;
                    report.success_count += 1;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    let stack = format!("{err:?}");
                    error!("作业 {} 计算失败: {}", key, message);
                    self.registry
                        .error(&key, &self.worker, &message, Some(&stack))
                        .await?;
                    if !options.suppress_errors {
                        return Err(SchedulerError::JobExecution(message));
                    }
                    report.errors.push((key, message));
                }
            }
        }

        info!(
            "填充完成: 成功 {} 个, 失败 {} 个, 跳过 {} 个",
            report.success_count,
            report.errors.len(),
            report.skipped
        );
        Ok(report)
    }
}
