use serde::{Deserialize, Serialize};

use crate::config::{
    is_plain_identifier, DEFAULT_PRIORITY, ERROR_MESSAGE_LENGTH, TRUNCATION_APPENDIX,
};

/// 作业注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 被跟踪的计算表名称，注册表本身命名为 `~{target}_job`
    pub target: String,
    pub default_priority: i8,
    pub error_message_max_length: usize,
    /// 每轮从注册表取出的候选作业数量，0 表示不限制
    pub claimable_batch_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            target: "computed".to_string(),
            default_priority: DEFAULT_PRIORITY,
            error_message_max_length: ERROR_MESSAGE_LENGTH,
            claimable_batch_size: 0,
        }
    }
}

impl RegistryConfig {
    pub fn for_target(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// 注册表的存储表名
    pub fn table_name(&self) -> String {
        format!("~{}_job", self.target)
    }

    pub fn batch_limit(&self) -> Option<usize> {
        (self.claimable_batch_size > 0).then_some(self.claimable_batch_size)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !is_plain_identifier(&self.target) {
            return Err(anyhow::anyhow!(
                "计算表名称只能包含字母、数字和下划线: {}",
                self.target
            ));
        }

        if self.error_message_max_length <= TRUNCATION_APPENDIX.chars().count() {
            return Err(anyhow::anyhow!(
                "错误信息最大长度必须大于截断后缀长度 ({})",
                TRUNCATION_APPENDIX.len()
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name() {
        let config = RegistryConfig::for_target("experiment");
        assert_eq!(config.table_name(), "~experiment_job");
        assert_eq!(config.default_priority, 3);
        assert_eq!(config.error_message_max_length, 2047);
    }

    #[test]
    fn test_batch_limit() {
        let mut config = RegistryConfig::default();
        assert_eq!(config.batch_limit(), None);
        config.claimable_batch_size = 16;
        assert_eq!(config.batch_limit(), Some(16));
    }

    #[test]
    fn test_validation() {
        assert!(RegistryConfig::default().validate().is_ok());

        let bad_target = RegistryConfig::for_target("bad-name");
        assert!(bad_target.validate().is_err());

        let too_short = RegistryConfig {
            error_message_max_length: TRUNCATION_APPENDIX.len(),
            ..RegistryConfig::default()
        };
        assert!(too_short.validate().is_err());
    }
}
