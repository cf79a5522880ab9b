pub mod app_config;
pub mod database;
pub mod observability;
pub mod registry;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use observability::ObservabilityConfig;
pub use registry::RegistryConfig;
