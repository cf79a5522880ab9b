use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use jobreg_core::{AppConfig, WorkerIdentity};
use jobreg_domain::{
    JobKey, JobRecord, JobRegistry, JobStatus, KeyRestriction, OrderBy, PopulateOptions, Populator,
    StaticWorkSet,
};
use jobreg_infrastructure::DatabaseManager;
use serde_json::{json, Value};
use tracing::info;

use crate::shell_job::ShellJob;

/// 作业注册表命令行管理工具
#[derive(Parser, Debug)]
#[command(name = "jobctl")]
#[command(version = "1.0.0")]
#[command(about = "作业注册表 - 命令行管理工具")]
#[command(long_about = "对账、预约、查询和清理计算作业注册表中的记录")]
pub struct CliApp {
    #[command(subcommand)]
    pub command: Commands,

    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<String>,

    /// 日志级别 (trace/debug/info/warn/error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// 日志格式 (json/pretty)
    #[arg(long)]
    pub log_format: Option<String>,

    /// 命令结束后把计数指标以 Prometheus 文本格式输出到标准错误
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 创建注册表
    Init,
    /// 与工作集对账
    Refresh {
        /// 工作集文件，内容为作业键的JSON数组
        #[arg(short, long)]
        work_set: PathBuf,
        /// 只对账匹配该部分键的记录 (JSON对象)
        #[arg(short, long)]
        restriction: Option<String>,
    },
    /// 列出可调度的作业键
    Claimable {
        #[arg(short, long)]
        limit: Option<usize>,
        /// 排序，例如 "priority desc, timestamp"
        #[arg(short, long)]
        order: Option<String>,
    },
    /// 列出注册表记录
    List {
        #[arg(short, long)]
        status: Option<JobStatus>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// 显示单条记录
    Show {
        /// 作业键 (JSON对象)
        key: JobKey,
    },
    /// 预约作业
    Reserve { key: JobKey },
    /// 忽略作业，不再调度
    Ignore { key: JobKey },
    /// 修改优先级（数值越小越先调度）
    SetPriority {
        key: JobKey,
        #[arg(allow_hyphen_values = true)]
        priority: i8,
    },
    /// 删除记录（例如卡住的预约）
    Delete { key: JobKey },
    /// 列出长时间未完成的预约
    Stuck {
        #[arg(long, default_value = "60")]
        older_than_minutes: i64,
    },
    /// 各状态的记录数量
    Summary,
    /// 对工作集中的作业逐个预约并执行命令
    Populate {
        #[arg(short, long)]
        work_set: PathBuf,
        /// 只对账并执行匹配该部分键的作业 (JSON对象)
        #[arg(short, long)]
        restriction: Option<String>,
        /// 每个作业执行的 shell 命令，作业键通过 JOBREG_KEY 传入
        #[arg(long)]
        command: String,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        max_calls: Option<usize>,
        #[arg(short, long)]
        order: Option<String>,
        /// 跳过开始前的对账
        #[arg(long)]
        no_refresh: bool,
        /// 记录错误并继续
        #[arg(long)]
        suppress_errors: bool,
        /// 写入成功记录的版本信息 (JSON)
        #[arg(long)]
        run_version: Option<String>,
    },
}

/// 从文件读取作业键的JSON数组
pub fn read_work_set(path: &Path) -> Result<StaticWorkSet> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("读取工作集文件失败: {}", path.display()))?;
    let keys: Vec<JobKey> = serde_json::from_str(&text)
        .with_context(|| format!("工作集文件必须是作业键的JSON数组: {}", path.display()))?;
    for key in &keys {
        key.validate()?;
    }
    Ok(StaticWorkSet::new(keys))
}

/// 解析部分键形式的范围限定，例如 `{"subject_id": 1}`
pub fn parse_restriction(text: Option<&str>) -> Result<Option<KeyRestriction>> {
    text.map(|text| -> Result<_> {
        let partial = JobKey::parse(text).with_context(|| format!("无效的范围限定: {text}"))?;
        Ok(KeyRestriction::new(partial)?)
    })
    .transpose()
}

fn parse_order(order: Option<&str>) -> Result<Option<Vec<OrderBy>>> {
    order
        .map(OrderBy::parse_list)
        .transpose()
        .context("解析排序参数失败")
}

fn record_json(record: &JobRecord) -> Value {
    json!({
        "key": record.key,
        "status": record.status.as_str(),
        "priority": record.priority,
        "error_message": record.error_message,
        "error_stack": record.error_stack,
        "run_duration": record.run_duration,
        "run_version": record.run_version,
        "user": record.user,
        "host": record.host,
        "pid": record.pid,
        "connection_id": record.connection_id,
        "timestamp": record.timestamp.to_rfc3339(),
    })
}

fn print_records_table(records: &[JobRecord]) {
    if records.is_empty() {
        println!("没有匹配的记录");
        return;
    }
    println!(
        "{:<40} {:<10} {:<8} {:<26} {}",
        "作业键", "状态", "优先级", "时间戳", "Worker"
    );
    println!("{}", "-".repeat(110));
    for record in records {
        println!(
            "{:<40} {:<10} {:<8} {:<26} {}",
            record.key.to_string(),
            record.status.as_str(),
            record.priority,
            record.timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
            record.worker().describe()
        );
    }
}

impl CliApp {
    pub async fn run(self, config: AppConfig) -> Result<()> {
        let manager = DatabaseManager::new(&config.database).await?;
        let registry = Arc::new(manager.job_registry(&config.registry).await?);
        // SQLite 没有连接号，用本次调用的启动时刻区分会话
        let worker = WorkerIdentity::current(Utc::now().timestamp_micros().unsigned_abs());

        let result = execute(self.command, &registry, &worker).await;
        manager.close().await;
        result
    }
}

async fn execute(command: Commands, registry: &Arc<JobRegistry>, worker: &WorkerIdentity) -> Result<()> {
    match command {
        Commands::Init => {
            println!("注册表已就绪: {}", registry.config().table_name());
        }
        Commands::Refresh {
            work_set,
            restriction,
        } => {
            let work_set = read_work_set(&work_set)?;
            let restriction = parse_restriction(restriction.as_deref())?;
            let summary = registry.refresh(&work_set, restriction.as_ref()).await?;
            println!(
                "对账完成: 新增 {}, 移除 {}, 已存在 {}",
                summary.inserted, summary.removed, summary.already_present
            );
        }
        Commands::Claimable { limit, order } => {
            let order = parse_order(order.as_deref())?;
            let limit = limit.or(registry.config().batch_limit());
            for key in registry.get_claimable(limit, order.as_deref()).await? {
                println!("{key}");
            }
        }
        Commands::List { status, limit } => {
            let records = registry.list(status, limit).await?;
            print_records_table(&records);
        }
        Commands::Show { key } => match registry.fetch(&key).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record_json(&record))?),
            None => return Err(anyhow::anyhow!("作业不存在: {key}")),
        },
        Commands::Reserve { key } => {
            if registry.reserve(&key, worker).await?.is_claimed() {
                println!("预约成功: {key}");
            } else {
                println!("作业已被占用: {key}");
            }
        }
        Commands::Ignore { key } => {
            if registry.ignore(&key, worker).await?.is_claimed() {
                println!("已忽略: {key}");
            } else {
                println!("作业已被占用，无法忽略: {key}");
            }
        }
        Commands::SetPriority { key, priority } => {
            registry.set_priority(&key, priority).await?;
            println!("优先级已更新: {key} -> {priority}");
        }
        Commands::Delete { key } => {
            if registry.delete(&key).await? {
                println!("已删除: {key}");
            } else {
                println!("作业不存在: {key}");
            }
        }
        Commands::Stuck { older_than_minutes } => {
            let cutoff = Utc::now() - Duration::minutes(older_than_minutes);
            let records = registry.stuck_reservations(cutoff).await?;
            print_records_table(&records);
        }
        Commands::Summary => {
            let counts = registry.status_counts().await?;
            for status in JobStatus::ALL {
                println!("{:<10} {}", status.as_str(), counts.get(status));
            }
            println!("{:<10} {}", "total", counts.total());
        }
        Commands::Populate {
            work_set,
            restriction,
            command,
            limit,
            max_calls,
            order,
            no_refresh,
            suppress_errors,
            run_version,
        } => {
            let work_set = read_work_set(&work_set)?;
            let run_version = run_version
                .map(|text| serde_json::from_str::<Value>(&text))
                .transpose()
                .context("解析 run_version 失败，请确保是有效的JSON格式")?;
            let options = PopulateOptions {
                refresh_jobs: !no_refresh,
                limit: limit.or(registry.config().batch_limit()),
                max_calls,
                order_by: parse_order(order.as_deref())?.unwrap_or_default(),
                suppress_errors,
                run_version,
                restriction: parse_restriction(restriction.as_deref())?,
            };

            info!("开始填充: {}", command);
            let populator = Populator::new(Arc::clone(registry), worker.clone());
            let report = populator
                .populate(&work_set, &ShellJob::new(command), &options)
                .await?;

            println!(
                "填充完成: 成功 {}, 失败 {}, 跳过 {}",
                report.success_count,
                report.errors.len(),
                report.skipped
            );
            for (key, message) in &report.errors {
                println!("  {key}: {message}");
            }
        }
    }

    Ok(())
}
