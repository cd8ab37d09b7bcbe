use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_CONCURRENT_TOOLS: usize = 8;
const DEFAULT_MAX_MODEL_REQUESTS: u32 = 50;

/// Per-agent execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Deadline for one model call, from request start to the final chunk.
    pub model_timeout_secs: Option<u64>,
    /// Deadline for one tool handler invocation.
    pub tool_timeout_secs: Option<u64>,
    pub max_concurrent_tools: usize,
    /// Extra attempts when a model stream fails to start.
    pub model_retries: u32,
    pub retry_backoff_ms: u64,
    /// Extra model turns allowed when the final output fails its schema.
    pub output_retries: u32,
    pub max_model_requests: u32,
    pub logging: LoggingConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_timeout_secs: Some(DEFAULT_MODEL_TIMEOUT_SECS),
            tool_timeout_secs: Some(DEFAULT_TOOL_TIMEOUT_SECS),
            max_concurrent_tools: DEFAULT_MAX_CONCURRENT_TOOLS,
            model_retries: 2,
            retry_backoff_ms: 500,
            output_retries: 1,
            max_model_requests: DEFAULT_MAX_MODEL_REQUESTS,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_directive: String,
    /// Write to this file instead of stderr.
    pub file: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            file: None,
            ansi: true,
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigurationError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrent_tools == 0 {
            return Err(ConfigurationError::invalid(
                "max_concurrent_tools",
                "must be at least 1",
            ));
        }
        if self.max_model_requests == 0 {
            return Err(ConfigurationError::invalid(
                "max_model_requests",
                "must be at least 1",
            ));
        }
        if self.model_timeout_secs == Some(0) {
            return Err(ConfigurationError::invalid(
                "model_timeout_secs",
                "must be positive when set",
            ));
        }
        if self.tool_timeout_secs == Some(0) {
            return Err(ConfigurationError::invalid(
                "tool_timeout_secs",
                "must be positive when set",
            ));
        }
        Ok(())
    }

    pub fn model_timeout(&self) -> Option<Duration> {
        self.model_timeout_secs.map(Duration::from_secs)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}
