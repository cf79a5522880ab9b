use anyhow::{Context, Result};
use jobreg_core::{AppConfig, LogFormat, LogLevel};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统；`RUST_LOG` 优先于传入的级别
///
/// 日志写到标准错误，标准输出留给命令结果。
pub fn init_logging(log_level: LogLevel, log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_filter()));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        LogFormat::Pretty => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
    }

    Ok(())
}

/// 安装全局的 Prometheus 指标记录器，返回用于导出文本的句柄
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("安装指标记录器失败")?;
    info!("指标记录器已安装");
    Ok(handle)
}

/// 加载配置，命令行参数覆盖配置文件中的日志设置
pub fn load_config(
    config_path: Option<&str>,
    log_level: Option<&str>,
    log_format: Option<&str>,
) -> Result<AppConfig> {
    let mut config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载默认配置失败".to_string(),
    })?;

    if let Some(level) = log_level {
        config.observability.log_level = level.to_string();
    }
    if let Some(format) = log_format {
        config.observability.log_format = format.to_string();
    }
    config.observability.validate()?;

    Ok(config)
}
