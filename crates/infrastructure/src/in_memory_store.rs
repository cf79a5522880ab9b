use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use jobreg_domain::{compare_records, JobFilter, JobKey, JobQuery, JobRecord, JobStatus, JobStore};
use jobreg_errors::{SchedulerError, SchedulerResult};
use tokio::sync::RwLock;
use tracing::debug;

/// 内存作业存储
///
/// 使用单个读写锁保护全部记录，每个原语在锁内完成，因此与 SQLite 实现
/// 一样满足插入和条件替换的原子性。适用于嵌入式部署和测试。
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    records: Arc<RwLock<BTreeMap<JobKey, JobRecord>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn ensure_schema(&self) -> SchedulerResult<()> {
        Ok(())
    }

    async fn insert(&self, record: &JobRecord, replace: bool) -> SchedulerResult<()> {
        let mut records = self.records.write().await;
        if !replace && records.contains_key(&record.key) {
            return Err(SchedulerError::duplicate_key(record.key.canonical()));
        }
        records.insert(record.key.clone(), record.clone());
        debug!("写入作业记录: {}", record.entity_description());
        Ok(())
    }

    async fn replace_if_status(
        &self,
        record: &JobRecord,
        expected: &[JobStatus],
    ) -> SchedulerResult<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.key) {
            Some(existing) if expected.contains(&existing.status) => {
                *existing = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_priority(&self, key: &JobKey, priority: i8) -> SchedulerResult<bool> {
        let mut records = self.records.write().await;
        Ok(records
            .get_mut(key)
            .map(|record| record.priority = priority)
            .is_some())
    }

    async fn fetch(&self, query: &JobQuery) -> SchedulerResult<Vec<JobRecord>> {
        let records = self.records.read().await;
        let mut matched: Vec<JobRecord> = records
            .values()
            .filter(|record| query.filter.matches(record))
            .cloned()
            .collect();
        drop(records);

        let order = query.effective_order();
        matched.sort_by(|a, b| compare_records(a, b, &order));
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn delete(&self, filter: &JobFilter) -> SchedulerResult<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !filter.matches(record));
        Ok((before - records.len()) as u64)
    }
}
