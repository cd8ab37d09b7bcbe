use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::error::TransportError;
use crate::tools::registry::RegistryError;
use fathom_tools::SchemaError;

/// Fatal problems detected before a session starts.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Invalid output schema: {0}")]
    OutputSchema(#[source] SchemaError),

    #[error("Invalid dependency bundle: {0}")]
    Dependencies(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

impl ConfigurationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }

    pub fn dependencies(reason: impl Into<String>) -> Self {
        Self::Dependencies(reason.into())
    }
}

/// Why a session ended in `Failed`. Carried by the terminal node.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("Model transport failed: {error}")]
    Transport { error: TransportError },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Exceeded the limit of {limit} model requests")]
    RequestLimitExceeded { limit: u32 },
}

impl From<TransportError> for RunFailure {
    fn from(error: TransportError) -> Self {
        Self::Transport { error }
    }
}

/// Errors returned to the caller driving a session.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Failed(#[from] RunFailure),

    #[error("Session {session_id} already reached its end node")]
    SessionFinished { session_id: String },

    #[error("The stream for node {node_id} is still open and has not finished")]
    StageInProgress { node_id: String },

    #[error("No stream available for node {node_id}")]
    StreamUnavailable { node_id: String },
}

pub type Result<T, E = RunError> = std::result::Result<T, E>;
