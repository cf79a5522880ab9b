use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobreg_domain::{JobFilter, JobKey, JobQuery, JobRecord, JobStatus, JobStore, KeyValue};
use jobreg_errors::SchedulerResult;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{query::Query, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

use crate::{
    error_handling::{JobOperationContext, RepositoryErrorHelpers, RepositoryOperation},
    job_context,
};

const COLUMNS: &str = "job_key, status, priority, error_message, error_stack, run_duration, run_version, user, host, pid, connection_id, timestamp";

/// 绑定到动态SQL上的参数
#[derive(Debug, Clone)]
enum SqlArg {
    Int(i64),
    Text(String),
}

pub struct SqliteJobStore {
    pool: SqlitePool,
    table: String,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn quoted_table(&self) -> String {
        format!("\"{}\"", self.table.replace('"', "\"\""))
    }

    fn to_micros(ts: DateTime<Utc>) -> i64 {
        ts.timestamp_micros()
    }

    fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
        let secs = micros.div_euclid(1_000_000);
        let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
        DateTime::from_timestamp(secs, nanos)
    }

    fn row_to_record(&self, row: &SqliteRow) -> SchedulerResult<JobRecord> {
        let context = job_context!(RepositoryOperation::Query, &self.table);

        let key_text: String = row.try_get("job_key")?;
        let key: JobKey = serde_json::from_str(&key_text)
            .map_err(|e| RepositoryErrorHelpers::job_decode_error(context.clone(), e))?;

        let priority: i64 = row.try_get("priority")?;
        let priority = i8::try_from(priority)
            .map_err(|e| RepositoryErrorHelpers::job_decode_error(context.clone(), e))?;

        let run_version = row
            .try_get::<Option<String>, _>("run_version")?
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(|e| RepositoryErrorHelpers::job_decode_error(context.clone(), e))?;

        let pid: i64 = row.try_get("pid")?;
        let pid = u32::try_from(pid)
            .map_err(|e| RepositoryErrorHelpers::job_decode_error(context.clone(), e))?;
        let connection_id: i64 = row.try_get("connection_id")?;

        let micros: i64 = row.try_get("timestamp")?;
        let timestamp = Self::from_micros(micros).ok_or_else(|| {
            RepositoryErrorHelpers::job_decode_error(context.clone(), format!("无效的时间戳: {micros}"))
        })?;

        Ok(JobRecord {
            key,
            status: row.try_get::<JobStatus, _>("status")?,
            priority,
            error_message: row.try_get("error_message")?,
            error_stack: row.try_get("error_stack")?,
            run_duration: row.try_get("run_duration")?,
            run_version,
            user: row.try_get("user")?,
            host: row.try_get("host")?,
            pid,
            // 按位保存，读取时还原
            connection_id: connection_id as u64,
            timestamp,
        })
    }

    fn run_version_json(&self, record: &JobRecord, context: &JobOperationContext) -> SchedulerResult<Option<String>> {
        record
            .run_version
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryErrorHelpers::job_serialization_error(context.clone(), e))
    }

    /// 把过滤条件翻译为 WHERE 子句
    fn where_clause(filter: &JobFilter, args: &mut Vec<SqlArg>) -> String {
        let mut conditions = vec!["1=1".to_string()];

        if let Some(key) = &filter.key {
            conditions.push("job_key = ?".to_string());
            args.push(SqlArg::Text(key.canonical()));
        }

        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            conditions.push(format!("status IN ({placeholders})"));
            args.extend(filter.statuses.iter().map(|s| SqlArg::Text(s.as_str().to_string())));
        }

        if let Some(restriction) = &filter.restriction {
            for (field, value) in restriction.fields() {
                conditions.push("json_extract(job_key, ?) = ?".to_string());
                args.push(SqlArg::Text(format!("$.\"{field}\"")));
                args.push(match value {
                    KeyValue::Int(i) => SqlArg::Int(*i),
                    KeyValue::Bool(b) => SqlArg::Int(i64::from(*b)),
                    KeyValue::Text(s) => SqlArg::Text(s.clone()),
                });
            }
        }

        if let Some(cutoff) = filter.older_than {
            conditions.push("timestamp < ?".to_string());
            args.push(SqlArg::Int(Self::to_micros(cutoff)));
        }

        conditions.join(" AND ")
    }

    fn bind_args<'q>(
        mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
        args: &'q [SqlArg],
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        for arg in args {
            query = match arg {
                SqlArg::Int(i) => query.bind(*i),
                SqlArg::Text(s) => query.bind(s.as_str()),
            };
        }
        query
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn ensure_schema(&self) -> SchedulerResult<()> {
        let context = job_context!(RepositoryOperation::Migrate, &self.table);
        let table = self.quoted_table();

        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                job_key TEXT PRIMARY KEY NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('scheduled', 'reserved', 'success', 'error', 'ignore')),
                priority INTEGER NOT NULL DEFAULT 3,
                error_message TEXT NOT NULL DEFAULT '',
                error_stack TEXT,
                run_duration REAL,
                run_version TEXT,
                user TEXT NOT NULL DEFAULT '',
                host TEXT NOT NULL DEFAULT '',
                pid INTEGER NOT NULL DEFAULT 0,
                connection_id INTEGER NOT NULL DEFAULT 0,
                timestamp INTEGER NOT NULL
            )
            "#
        );
        let index_name = format!("\"{}_schedule_idx\"", self.table.replace('"', "\"\""));
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {index_name} ON {table} (status, priority, timestamp)"
        );

        for sql in [create_table, create_index] {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;
        }

        RepositoryErrorHelpers::log_operation_success(&context, None);
        Ok(())
    }

    #[instrument(skip(self, record), fields(
        table = %self.table,
        job_key = %record.key,
        status = %record.status,
    ))]
    async fn insert(&self, record: &JobRecord, replace: bool) -> SchedulerResult<()> {
        let operation = if replace {
            RepositoryOperation::Replace
        } else {
            RepositoryOperation::Create
        };
        let context = job_context!(operation, &self.table, key = &record.key, status = record.status);
        let run_version = self.run_version_json(record, &context)?;

        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
        let sql = format!(
            "{verb} INTO {} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.quoted_table()
        );

        sqlx::query(&sql)
            .bind(record.key.canonical())
            .bind(record.status)
            .bind(i64::from(record.priority))
            .bind(&record.error_message)
            .bind(&record.error_stack)
            .bind(record.run_duration)
            .bind(run_version)
            .bind(&record.user)
            .bind(&record.host)
            .bind(i64::from(record.pid))
            .bind(record.connection_id as i64)
            .bind(Self::to_micros(record.timestamp))
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;

        RepositoryErrorHelpers::log_operation_success(&context, None);
        Ok(())
    }

    #[instrument(skip(self, record, expected), fields(
        table = %self.table,
        job_key = %record.key,
        status = %record.status,
    ))]
    async fn replace_if_status(&self, record: &JobRecord, expected: &[JobStatus]) -> SchedulerResult<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let context = job_context!(
            RepositoryOperation::ConditionalReplace,
            &self.table,
            key = &record.key,
            status = record.status
        );
        let run_version = self.run_version_json(record, &context)?;

        let placeholders = vec!["?"; expected.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE {}
            SET status = ?, priority = ?, error_message = ?, error_stack = ?, run_duration = ?,
                run_version = ?, user = ?, host = ?, pid = ?, connection_id = ?, timestamp = ?
            WHERE job_key = ? AND status IN ({placeholders})
            "#,
            self.quoted_table()
        );

        let mut query = sqlx::query(&sql)
            .bind(record.status)
            .bind(i64::from(record.priority))
            .bind(&record.error_message)
            .bind(&record.error_stack)
            .bind(record.run_duration)
            .bind(run_version)
            .bind(&record.user)
            .bind(&record.host)
            .bind(i64::from(record.pid))
            .bind(record.connection_id as i64)
            .bind(Self::to_micros(record.timestamp))
            .bind(record.key.canonical());
        for status in expected {
            query = query.bind(*status);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;

        let replaced = result.rows_affected() == 1;
        RepositoryErrorHelpers::log_operation_success(
            &context,
            Some(if replaced { "已写入" } else { "状态不符，未写入" }),
        );
        Ok(replaced)
    }

    #[instrument(skip(self, key), fields(table = %self.table, job_key = %key))]
    async fn update_priority(&self, key: &JobKey, priority: i8) -> SchedulerResult<bool> {
        let context = job_context!(RepositoryOperation::Update, &self.table, key = key);
        let sql = format!("UPDATE {} SET priority = ? WHERE job_key = ?", self.quoted_table());

        let result = sqlx::query(&sql)
            .bind(i64::from(priority))
            .bind(key.canonical())
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, query), fields(table = %self.table, limit = ?query.limit))]
    async fn fetch(&self, query: &JobQuery) -> SchedulerResult<Vec<JobRecord>> {
        let context = job_context!(RepositoryOperation::Query, &self.table)
            .with_additional_info(format!("过滤器: {:?}", query.filter));

        let mut args = Vec::new();
        let mut sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE {}",
            self.quoted_table(),
            Self::where_clause(&query.filter, &mut args)
        );

        let order: Vec<String> = query.effective_order().iter().map(|o| o.to_string()).collect();
        sql.push_str(&format!(" ORDER BY {}, job_key ASC", order.join(", ")));

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlArg::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let rows = Self::bind_args(sqlx::query(&sql), &args)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;

        let records = rows
            .iter()
            .map(|row| self.row_to_record(row))
            .collect::<SchedulerResult<Vec<_>>>()?;
        debug!("查询作业记录成功，返回 {} 条", records.len());
        Ok(records)
    }

    #[instrument(skip(self, filter), fields(table = %self.table))]
    async fn delete(&self, filter: &JobFilter) -> SchedulerResult<u64> {
        let mut context = job_context!(RepositoryOperation::Delete, &self.table);
        if let Some(key) = &filter.key {
            context = context.with_job_key(key);
        }

        let mut args = Vec::new();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.quoted_table(),
            Self::where_clause(filter, &mut args)
        );

        let result = Self::bind_args(sqlx::query(&sql), &args)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::job_database_error(context.clone(), e))?;

        let deleted = result.rows_affected();
        RepositoryErrorHelpers::log_operation_success(&context, Some(format!("删除 {deleted} 条").as_str()));
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobreg_domain::{OrderBy, SortField};
    use jobreg_errors::SchedulerError;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_store() -> SqliteJobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteJobStore::new(pool, "~experiment_job");
        store.ensure_schema().await.unwrap();
        store
    }

    fn key(id: i64) -> JobKey {
        JobKey::new().with("subject_id", id)
    }

    fn scheduled(id: i64, priority: i8, ts: DateTime<Utc>) -> JobRecord {
        JobRecord::new(key(id), JobStatus::Scheduled, priority, ts)
    }

    fn base_time() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 123_456_000).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let store = setup_test_store().await;
        store.ensure_schema().await.unwrap();
        assert!(store.fetch(&JobQuery::new(JobFilter::all())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_and_fetch_round_trip() {
        let store = setup_test_store().await;
        let mut record = JobRecord::new(key(1), JobStatus::Success, 2, base_time());
        record.run_duration = Some(2.5);
        record.run_version = Some(serde_json::json!({"v": 1}));
        record.error_stack = Some("trace".to_string());
        record.user = "alice".to_string();
        record.host = "node-1".to_string();
        record.pid = 4242;
        record.connection_id = u64::MAX;

        store.insert(&record, false).await.unwrap();
        let fetched = store.fetch(&JobQuery::new(JobFilter::key(&key(1)))).await.unwrap();
        assert_eq!(fetched, vec![record]);
    }

    #[tokio::test]
    async fn test_plain_insert_reports_duplicate_key() {
        let store = setup_test_store().await;
        store.insert(&scheduled(1, 3, base_time()), false).await.unwrap();

        let err = store.insert(&scheduled(1, 3, base_time()), false).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateKey { ref key } if key == r#"{"subject_id":1}"#));

        // replace 模式总是成功
        store.insert(&scheduled(1, 1, base_time()), true).await.unwrap();
        let fetched = store.fetch(&JobQuery::new(JobFilter::all())).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].priority, 1);
    }

    #[tokio::test]
    async fn test_replace_if_status_is_conditional() {
        let store = setup_test_store().await;
        store.insert(&scheduled(1, 3, base_time()), false).await.unwrap();

        let reserved = JobRecord::new(key(1), JobStatus::Reserved, 3, base_time());
        assert!(store.replace_if_status(&reserved, &[JobStatus::Scheduled]).await.unwrap());
        assert!(!store.replace_if_status(&reserved, &[JobStatus::Scheduled]).await.unwrap());
        assert!(!store.replace_if_status(&reserved, &[]).await.unwrap());

        let missing = JobRecord::new(key(9), JobStatus::Reserved, 3, base_time());
        assert!(!store.replace_if_status(&missing, &[JobStatus::Scheduled]).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_priority() {
        let store = setup_test_store().await;
        store.insert(&scheduled(1, 3, base_time()), false).await.unwrap();

        assert!(store.update_priority(&key(1), -5).await.unwrap());
        assert!(!store.update_priority(&key(2), 1).await.unwrap());

        let fetched = store.fetch(&JobQuery::new(JobFilter::key(&key(1)))).await.unwrap();
        assert_eq!(fetched[0].priority, -5);
        assert_eq!(fetched[0].status, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_fetch_orders_and_limits() {
        let store = setup_test_store().await;
        let t1 = base_time();
        store.insert(&scheduled(1, 5, t1 + Duration::seconds(1)), false).await.unwrap();
        store.insert(&scheduled(2, 1, t1), false).await.unwrap();
        store.insert(&scheduled(3, 1, t1 + Duration::seconds(2)), false).await.unwrap();

        let all = store.fetch(&JobQuery::new(JobFilter::all())).await.unwrap();
        let keys: Vec<_> = all.into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![key(2), key(3), key(1)]);

        let limited = store
            .fetch(&JobQuery::new(JobFilter::all()).limit(Some(1)))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].key, key(2));

        let newest_first = store
            .fetch(&JobQuery::new(JobFilter::all()).order_by(&[OrderBy::desc(SortField::Timestamp)]))
            .await
            .unwrap();
        assert_eq!(newest_first[0].key, key(3));
    }

    #[tokio::test]
    async fn test_restriction_filters_on_key_fields() {
        let store = setup_test_store().await;
        for (subject, session) in [(1, "a"), (1, "b"), (2, "a")] {
            let k = JobKey::new().with("subject_id", subject).with("session", session);
            store
                .insert(&JobRecord::new(k, JobStatus::Scheduled, 3, base_time()), false)
                .await
                .unwrap();
        }

        let restriction =
            jobreg_domain::KeyRestriction::new(JobKey::new().with("subject_id", 1)).unwrap();
        let matched = store
            .fetch(&JobQuery::new(JobFilter::all().within(Some(&restriction))))
            .await
            .unwrap();
        assert_eq!(matched.len(), 2);

        let restriction =
            jobreg_domain::KeyRestriction::new(JobKey::new().with("session", "a")).unwrap();
        let deleted = store
            .delete(&JobFilter::all().within(Some(&restriction)))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
    }

    #[tokio::test]
    async fn test_delete_respects_status_filter() {
        let store = setup_test_store().await;
        store.insert(&scheduled(1, 3, base_time()), false).await.unwrap();

        let deleted = store
            .delete(&JobFilter::key(&key(1)).with_statuses(&JobStatus::PRESERVED))
            .await
            .unwrap();
        assert_eq!(deleted, 0);

        let deleted = store.delete(&JobFilter::key(&key(1))).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_older_than_filter() {
        let store = setup_test_store().await;
        let t = base_time();
        store.insert(&scheduled(1, 3, t), false).await.unwrap();
        store.insert(&scheduled(2, 3, t + Duration::minutes(10)), false).await.unwrap();

        let old = store
            .fetch(&JobQuery::new(JobFilter::all().older_than(t + Duration::minutes(5))))
            .await
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].key, key(1));
    }

    #[test]
    fn test_micros_round_trip() {
        let t = base_time();
        let micros = SqliteJobStore::to_micros(t);
        assert_eq!(SqliteJobStore::from_micros(micros), Some(t));
        let before_epoch = DateTime::from_timestamp(-10, 500_000_000).unwrap();
        assert_eq!(
            SqliteJobStore::from_micros(SqliteJobStore::to_micros(before_epoch)),
            Some(before_epoch)
        );
    }
}
