use async_trait::async_trait;
use jobreg_errors::SchedulerResult;

use crate::value_objects::{JobKey, KeyRestriction};

/// 工作集枚举器：给出当前有效的作业键
///
/// 对同一底层数据状态必须返回相同的有序结果。
#[async_trait]
pub trait WorkSetEnumerator: Send + Sync {
    async fn enumerate(&self, restriction: Option<&KeyRestriction>) -> SchedulerResult<Vec<JobKey>>;
}

/// 固定键列表构成的工作集
#[derive(Debug, Clone, Default)]
pub struct StaticWorkSet {
    keys: Vec<JobKey>,
}

impl StaticWorkSet {
    pub fn new(keys: Vec<JobKey>) -> Self {
        let mut keys = keys;
        keys.sort();
        keys.dedup();
        Self { keys }
    }

    pub fn keys(&self) -> &[JobKey] {
        &self.keys
    }
}

impl FromIterator<JobKey> for StaticWorkSet {
    fn from_iter<I: IntoIterator<Item = JobKey>>(iter: I) -> Self {
        StaticWorkSet::new(iter.into_iter().collect())
    }
}

#[async_trait]
impl WorkSetEnumerator for StaticWorkSet {
    async fn enumerate(&self, restriction: Option<&KeyRestriction>) -> SchedulerResult<Vec<JobKey>> {
        Ok(self
            .keys
            .iter()
            .filter(|k| restriction.map_or(true, |r| r.matches(k)))
            .cloned()
            .collect())
    }
}
