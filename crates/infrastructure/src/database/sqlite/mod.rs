pub mod sqlite_job_store;

pub use sqlite_job_store::SqliteJobStore;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobreg_core::{DatabaseConfig, RegistryConfig};
use jobreg_domain::{JobRegistry, JobStore};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqlitePool};
use tracing::info;

pub type DbPool = Pool<Sqlite>;

/// 内存数据库的每个连接都是独立的库，只能使用单个常驻连接
fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 文件数据库不存在时自动创建，并启用WAL模式以支持多连接并发写入
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let memory = is_memory_url(&config.url);

        let mut connect_options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("解析数据库URL失败: {}", config.url))?
            .create_if_missing(true);
        if !memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let options = if memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
                .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
        };

        let pool = options
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await
            .with_context(|| format!("无法连接数据库: {}", config.url))?;

        info!("数据库连接池已建立: {}", config.url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// 为指定计算表创建作业存储，并确保注册表存在
    pub async fn job_store(&self, registry: &RegistryConfig) -> Result<Arc<dyn JobStore>> {
        let store = SqliteJobStore::new(self.pool.clone(), registry.table_name());
        store.ensure_schema().await?;
        Ok(Arc::new(store))
    }

    pub async fn job_registry(&self, registry: &RegistryConfig) -> Result<JobRegistry> {
        let store = self.job_store(registry).await?;
        Ok(JobRegistry::new(store, registry.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobreg_domain::{JobKey, JobStatus};

    fn memory_config() -> DatabaseConfig {
        DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn test_memory_url_detection() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(is_memory_url("sqlite://file:jobs?mode=memory&cache=shared"));
        assert!(!is_memory_url("sqlite://jobs.db"));
    }

    #[tokio::test]
    async fn test_sqlite_database_manager() {
        let manager = DatabaseManager::new(&memory_config()).await.unwrap();
        assert!(manager.health_check().await.is_ok());

        let registry = manager
            .job_registry(&RegistryConfig::for_target("experiment"))
            .await
            .unwrap();
        assert_eq!(registry.config().table_name(), "~experiment_job");
        assert_eq!(registry.status_counts().await.unwrap().total(), 0);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_registries_for_different_targets_are_separate() {
        let manager = DatabaseManager::new(&memory_config()).await.unwrap();
        let first = manager
            .job_registry(&RegistryConfig::for_target("first"))
            .await
            .unwrap();
        let second = manager
            .job_registry(&RegistryConfig::for_target("second"))
            .await
            .unwrap();

        let worker = jobreg_core::WorkerIdentity::new("tester", "localhost", 1, 1);
        let key = JobKey::new().with("id", 1);
        assert!(first.reserve(&key, &worker).await.unwrap().is_claimed());

        assert_eq!(first.status_counts().await.unwrap().get(JobStatus::Reserved), 1);
        assert_eq!(second.status_counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_file_database_persists_between_managers() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("jobs.db").display()),
            ..DatabaseConfig::default()
        };
        let registry_config = RegistryConfig::for_target("experiment");
        let worker = jobreg_core::WorkerIdentity::new("tester", "localhost", 1, 1);
        let key = JobKey::new().with("id", 1);

        let manager = DatabaseManager::new(&config).await.unwrap();
        let registry = manager.job_registry(&registry_config).await.unwrap();
        registry.complete(&key, &worker, Some(1.5), None).await.unwrap();
        manager.close().await;

        let manager = DatabaseManager::new(&config).await.unwrap();
        let registry = manager.job_registry(&registry_config).await.unwrap();
        let record = registry.fetch(&key).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.run_duration, Some(1.5));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_default_config_creates_missing_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        // 与默认配置相同的URL形式，只是指向临时目录
        let config = DatabaseConfig {
            url: DatabaseConfig::default()
                .url
                .replace("jobs.db", &path.display().to_string()),
            ..DatabaseConfig::default()
        };
        assert!(!path.exists());

        let manager = DatabaseManager::new(&config).await.unwrap();
        manager.health_check().await.unwrap();
        manager
            .job_registry(&RegistryConfig::default())
            .await
            .unwrap();
        assert!(path.exists());
        manager.close().await;
    }
}
