pub mod entities;
pub mod job_query;
pub mod populate;
pub mod ports;
pub mod repositories;
pub mod services;
pub mod value_objects;

// SQLx 实现（仅在启用 sqlx-support feature 时编译）
#[cfg(feature = "sqlx-support")]
pub mod sqlx_impls;

pub use entities::*;
pub use job_query::*;
pub use jobreg_core::WorkerIdentity;
pub use jobreg_errors::{SchedulerError, SchedulerResult};
pub use populate::{MakeJob, PopulateOptions, PopulateReport, Populator};
pub use ports::*;
pub use repositories::*;
pub use services::*;
pub use value_objects::*;
