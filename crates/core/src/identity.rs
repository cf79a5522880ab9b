//! 调用方Worker身份
//!
//! 每次预约或上报结果都会写入这些诊断字段，记录最后一个写入者。
//! 身份以显式参数传入注册表操作，便于在没有真实主机环境时测试。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub user: String,
    pub host: String,
    pub pid: u32,
    pub connection_id: u64,
}

impl WorkerIdentity {
    pub fn new(user: impl Into<String>, host: impl Into<String>, pid: u32, connection_id: u64) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            pid,
            connection_id,
        }
    }

    /// 读取当前进程的主机名、进程号和登录用户
    pub fn current(connection_id: u64) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();

        Self {
            user,
            host,
            pid: std::process::id(),
            connection_id,
        }
    }

    pub fn describe(&self) -> String {
        format!("{}@{} (pid: {})", self.user, self.host, self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_identity() {
        let identity = WorkerIdentity::current(42);
        assert_eq!(identity.pid, std::process::id());
        assert_eq!(identity.connection_id, 42);
        assert!(!identity.host.is_empty());
    }

    #[test]
    fn test_describe() {
        let identity = WorkerIdentity::new("alice", "node-1", 1234, 7);
        assert_eq!(identity.describe(), "alice@node-1 (pid: 1234)");
    }
}
