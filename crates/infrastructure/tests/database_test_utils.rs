#![allow(dead_code)]

use std::sync::Arc;

use jobreg_core::{RegistryConfig, WorkerIdentity};
use jobreg_domain::{JobKey, JobRegistry, JobStore};
use jobreg_infrastructure::{InMemoryJobStore, SqliteJobStore};
use sqlx::sqlite::SqlitePoolOptions;

pub const TEST_TARGET: &str = "experiment";

/// 两种存储实现，场景测试对二者逐一运行
#[derive(Debug, Clone, Copy)]
pub enum StoreKind {
    Sqlite,
    InMemory,
}

impl StoreKind {
    pub const ALL: [StoreKind; 2] = [StoreKind::Sqlite, StoreKind::InMemory];
}

pub async fn create_store(kind: StoreKind) -> Arc<dyn JobStore> {
    match kind {
        StoreKind::Sqlite => {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await
                .expect("Failed to open in-memory SQLite");
            let store =
                SqliteJobStore::new(pool, RegistryConfig::for_target(TEST_TARGET).table_name());
            store.ensure_schema().await.expect("Failed to create job table");
            Arc::new(store)
        }
        StoreKind::InMemory => Arc::new(InMemoryJobStore::new()),
    }
}

pub async fn create_registry(kind: StoreKind) -> Arc<JobRegistry> {
    let store = create_store(kind).await;
    Arc::new(JobRegistry::new(store, RegistryConfig::for_target(TEST_TARGET)))
}

pub fn key(id: i64) -> JobKey {
    JobKey::new().with("subject_id", id)
}

pub fn session_key(subject: i64, session: &str) -> JobKey {
    JobKey::new().with("subject_id", subject).with("session", session)
}

pub fn worker(connection_id: u64) -> WorkerIdentity {
    WorkerIdentity::new("tester", "test-host", 4242, connection_id)
}
