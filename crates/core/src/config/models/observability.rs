use serde::{Deserialize, Serialize};

use crate::logging::{LogFormat, LogLevel};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.log_level
            .parse::<LogLevel>()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        self.log_format
            .parse::<LogFormat>()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(())
    }
}
