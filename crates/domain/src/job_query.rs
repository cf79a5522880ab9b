//! 注册表查询条件：过滤、排序和数量限制

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use jobreg_errors::SchedulerError;

use crate::entities::{JobRecord, JobStatus};
use crate::value_objects::{JobKey, KeyRestriction};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    /// 精确匹配单个作业键
    pub key: Option<JobKey>,
    /// 为空表示任意状态
    pub statuses: Vec<JobStatus>,
    pub restriction: Option<KeyRestriction>,
    /// 只匹配时间戳早于该时刻的记录
    pub older_than: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key(key: &JobKey) -> Self {
        Self {
            key: Some(key.clone()),
            ..Self::default()
        }
    }

    pub fn status(status: JobStatus) -> Self {
        Self::default().with_statuses(&[status])
    }

    pub fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn within(mut self, restriction: Option<&KeyRestriction>) -> Self {
        self.restriction = restriction.cloned();
        self
    }

    pub fn older_than(mut self, cutoff: DateTime<Utc>) -> Self {
        self.older_than = Some(cutoff);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some(key) = &self.key {
            if &record.key != key {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if let Some(restriction) = &self.restriction {
            if !restriction.matches(&record.key) {
                return false;
            }
        }
        if let Some(cutoff) = self.older_than {
            if record.timestamp >= cutoff {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Priority,
    Timestamp,
    Status,
    /// 按作业键的规范化JSON文本排序，与 SQLite 中 `job_key` 列的排序一致；
    /// 这不是按字段的数值顺序，例如 `{"id":10}` 排在 `{"id":9}` 之前
    Key,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::Priority => "priority",
            SortField::Timestamp => "timestamp",
            SortField::Status => "status",
            SortField::Key => "job_key",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub field: SortField,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: SortField) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    pub fn desc(field: SortField) -> Self {
        Self {
            field,
            descending: true,
        }
    }

    /// 默认调度顺序：优先级升序，其次时间戳升序
    pub fn scheduling_order() -> Vec<OrderBy> {
        vec![OrderBy::asc(SortField::Priority), OrderBy::asc(SortField::Timestamp)]
    }

    /// 解析逗号分隔的排序字段，例如 `"priority desc, timestamp"`
    pub fn parse_list(text: &str) -> Result<Vec<OrderBy>, SchedulerError> {
        text.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for OrderBy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let field = match parts.next().map(str::to_lowercase).as_deref() {
            Some("priority") => SortField::Priority,
            Some("timestamp") => SortField::Timestamp,
            Some("status") => SortField::Status,
            Some("key") | Some("job_key") => SortField::Key,
            _ => {
                return Err(SchedulerError::validation_error(format!(
                    "无效的排序字段: {s}"
                )))
            }
        };
        let descending = match parts.next().map(str::to_lowercase).as_deref() {
            None | Some("asc") => false,
            Some("desc") => true,
            Some(other) => {
                return Err(SchedulerError::validation_error(format!(
                    "无效的排序方向: {other}"
                )))
            }
        };
        if parts.next().is_some() {
            return Err(SchedulerError::validation_error(format!(
                "无效的排序表达式: {s}"
            )));
        }
        Ok(OrderBy { field, descending })
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.descending { "DESC" } else { "ASC" };
        write!(f, "{} {}", self.field.column(), direction)
    }
}

/// 按给定顺序比较两条记录，最后以作业键的规范化文本兜底保证结果确定
pub fn compare_records(a: &JobRecord, b: &JobRecord, order: &[OrderBy]) -> Ordering {
    for o in order {
        let ord = match o.field {
            SortField::Priority => a.priority.cmp(&b.priority),
            SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
            SortField::Status => a.status.as_str().cmp(b.status.as_str()),
            SortField::Key => a.key.canonical().cmp(&b.key.canonical()),
        };
        let ord = if o.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.key.canonical().cmp(&b.key.canonical())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobQuery {
    pub filter: JobFilter,
    /// 为空时按默认调度顺序
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn new(filter: JobFilter) -> Self {
        Self {
            filter,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn order_by(mut self, order: &[OrderBy]) -> Self {
        self.order_by = order.to_vec();
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn effective_order(&self) -> Vec<OrderBy> {
        if self.order_by.is_empty() {
            OrderBy::scheduling_order()
        } else {
            self.order_by.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: i64, priority: i8, ts: DateTime<Utc>) -> JobRecord {
        JobRecord::new(JobKey::new().with("id", id), JobStatus::Scheduled, priority, ts)
    }

    #[test]
    fn test_parse_order_by() {
        let order = OrderBy::parse_list("priority desc, timestamp").unwrap();
        assert_eq!(
            order,
            vec![OrderBy::desc(SortField::Priority), OrderBy::asc(SortField::Timestamp)]
        );
        assert!(OrderBy::parse_list("duration").is_err());
        assert!(OrderBy::parse_list("priority sideways").is_err());
        assert!("priority asc extra".parse::<OrderBy>().is_err());
    }

    #[test]
    fn test_scheduling_order_breaks_ties_by_timestamp() {
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(1);
        let t3 = t1 + Duration::seconds(2);
        let mut records = vec![record(1, 5, t2), record(2, 1, t1), record(3, 1, t3)];
        records.sort_by(|a, b| compare_records(a, b, &OrderBy::scheduling_order()));
        let ids: Vec<_> = records.iter().map(|r| r.key.get("id").cloned()).collect();
        assert_eq!(
            ids,
            vec![
                Some(crate::KeyValue::Int(2)),
                Some(crate::KeyValue::Int(3)),
                Some(crate::KeyValue::Int(1)),
            ]
        );
    }

    #[test]
    fn test_filter_matching() {
        let now = Utc::now();
        let r = record(1, 3, now);

        assert!(JobFilter::all().matches(&r));
        assert!(JobFilter::key(&r.key).matches(&r));
        assert!(!JobFilter::key(&JobKey::new().with("id", 2)).matches(&r));
        assert!(JobFilter::status(JobStatus::Scheduled).matches(&r));
        assert!(!JobFilter::status(JobStatus::Error).matches(&r));
        assert!(JobFilter::all().older_than(now + Duration::seconds(1)).matches(&r));
        assert!(!JobFilter::all().older_than(now).matches(&r));
    }

    #[test]
    fn test_effective_order_defaults() {
        let query = JobQuery::new(JobFilter::all());
        assert_eq!(query.effective_order(), OrderBy::scheduling_order());
        let query = query.order_by(&[OrderBy::desc(SortField::Timestamp)]);
        assert_eq!(query.effective_order(), vec![OrderBy::desc(SortField::Timestamp)]);
    }

    #[test]
    fn test_key_order_is_canonical_text_order() {
        let now = Utc::now();
        let nine = record(9, 3, now);
        let ten = record(10, 3, now);

        let by_key = [OrderBy::asc(SortField::Key)];
        assert_eq!(compare_records(&ten, &nine, &by_key), Ordering::Less);
        // 优先级和时间戳相同，兜底同样按文本
        assert_eq!(
            compare_records(&ten, &nine, &OrderBy::scheduling_order()),
            Ordering::Less
        );
    }
}
