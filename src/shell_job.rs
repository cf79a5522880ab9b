use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jobreg_domain::{JobKey, MakeJob};
use tokio::process::Command;
use tracing::debug;

/// 作业键通过该环境变量以JSON文本传给命令
pub const KEY_ENV_VAR: &str = "JOBREG_KEY";

/// 为每个作业键执行一条 shell 命令，退出码非零视为计算失败
pub struct ShellJob {
    command: String,
}

impl ShellJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl MakeJob for ShellJob {
    async fn make(&self, key: &JobKey) -> Result<()> {
        debug!("执行命令: {} ({}={})", self.command, KEY_ENV_VAR, key);
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(KEY_ENV_VAR, key.canonical())
            .output()
            .await
            .with_context(|| format!("无法启动命令: {}", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("命令退出状态 {}: {}", output.status, stderr.trim());
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_receives_key() {
        let key = JobKey::new().with("subject_id", 7);
        let job = ShellJob::new(r#"test "$JOBREG_KEY" = '{"subject_id":7}'"#);
        job.make(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        let key = JobKey::new().with("subject_id", 7);
        let err = ShellJob::new("echo broken >&2; exit 3")
            .make(&key)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
