use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use jobreg_core::WorkerIdentity;
use jobreg_errors::SchedulerError;
use serde::{Deserialize, Serialize};

use crate::value_objects::JobKey;

/// 作业状态，任意时刻只处于其中一种
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Reserved,
    Success,
    Error,
    Ignore,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Scheduled,
        JobStatus::Reserved,
        JobStatus::Success,
        JobStatus::Error,
        JobStatus::Ignore,
    ];

    /// 对账时若键已从工作集消失，这些状态的记录会被移除
    pub const PRESERVED: [JobStatus; 3] = [JobStatus::Reserved, JobStatus::Error, JobStatus::Ignore];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Reserved => "reserved",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
            JobStatus::Ignore => "ignore",
        }
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Scheduled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduled" => Ok(JobStatus::Scheduled),
            "reserved" => Ok(JobStatus::Reserved),
            "success" => Ok(JobStatus::Success),
            "error" => Ok(JobStatus::Error),
            "ignore" => Ok(JobStatus::Ignore),
            _ => Err(SchedulerError::validation_error(format!(
                "无效的作业状态: {s}"
            ))),
        }
    }
}

/// 注册表中的一行，跟踪一个作业键的生命周期和诊断信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: JobKey,
    pub status: JobStatus,
    pub priority: i8,
    pub error_message: String,
    pub error_stack: Option<String>,
    pub run_duration: Option<f64>,
    pub run_version: Option<serde_json::Value>,
    pub user: String,
    pub host: String,
    pub pid: u32,
    pub connection_id: u64,
    pub timestamp: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(key: JobKey, status: JobStatus, priority: i8, timestamp: DateTime<Utc>) -> Self {
        Self {
            key,
            status,
            priority,
            error_message: String::new(),
            error_stack: None,
            run_duration: None,
            run_version: None,
            user: String::new(),
            host: String::new(),
            pid: 0,
            connection_id: 0,
            timestamp,
        }
    }

    pub fn with_worker(mut self, worker: &WorkerIdentity) -> Self {
        self.user = worker.user.clone();
        self.host = worker.host.clone();
        self.pid = worker.pid;
        self.connection_id = worker.connection_id;
        self
    }

    pub fn worker(&self) -> WorkerIdentity {
        WorkerIdentity::new(self.user.clone(), self.host.clone(), self.pid, self.connection_id)
    }

    pub fn entity_description(&self) -> String {
        format!("作业 {} (状态: {})", self.key, self.status)
    }
}

/// `reserve` / `ignore` 的结果；“已被占用”是正常结果而非故障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyTaken,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

/// 一次对账的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub removed: u64,
    pub inserted: u64,
    /// 插入时发现已被并发写入的键
    pub already_present: u64,
}

/// 各状态的记录数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub scheduled: u64,
    pub reserved: u64,
    pub success: u64,
    pub error: u64,
    pub ignore: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Scheduled => self.scheduled += count,
            JobStatus::Reserved => self.reserved += count,
            JobStatus::Success => self.success += count,
            JobStatus::Error => self.error += count,
            JobStatus::Ignore => self.ignore += count,
        }
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Scheduled => self.scheduled,
            JobStatus::Reserved => self.reserved,
            JobStatus::Success => self.success,
            JobStatus::Error => self.error,
            JobStatus::Ignore => self.ignore,
        }
    }

    pub fn total(&self) -> u64 {
        self.scheduled + self.reserved + self.success + self.error + self.ignore
    }
}
