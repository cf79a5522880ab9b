use anyhow::Result;
use clap::Parser;
use jobreg_core::{LogFormat, LogLevel};
use tracing::{debug, info};

mod cli;
mod common;
mod shell_job;

use cli::CliApp;
use common::{init_logging, init_metrics, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    let app = CliApp::parse();

    // 加载配置
    let config = load_config(
        app.config.as_deref(),
        app.log_level.as_deref(),
        app.log_format.as_deref(),
    )?;

    // 初始化日志系统
    let log_level: LogLevel = config.observability.log_level.parse()?;
    let log_format: LogFormat = config.observability.log_format.parse()?;
    init_logging(log_level, log_format)?;
    let metrics = if app.metrics {
        Some(init_metrics()?)
    } else {
        None
    };

    info!("作业注册表: {}", config.registry.table_name());
    debug!("数据库: {}", config.database.url);

    let result = app.run(config).await;
    if let Some(handle) = metrics {
        eprint!("{}", handle.render());
    }
    result
}
