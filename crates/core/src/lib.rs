pub mod config;
pub mod identity;
pub mod logging;

pub use config::models::{AppConfig, DatabaseConfig, ObservabilityConfig, RegistryConfig};
pub use identity::WorkerIdentity;
pub use jobreg_errors::{SchedulerError, SchedulerResult};
pub use logging::{LogFormat, LogLevel};
