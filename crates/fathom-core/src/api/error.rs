use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportErrorKind {
    RateLimited,
    Unauthorized,
    Other,
}

/// Failure talking to the model backend. Raised while a model stage is
/// generating; it ends the session.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportError {
    #[error("Rate limited by {provider}: {details}")]
    RateLimited { provider: String, details: String },

    #[error("Authentication failed for {provider}: {details}")]
    Unauthorized { provider: String, details: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("{provider} upstream failure: {details}")]
    Upstream { provider: String, details: String },
}

impl TransportError {
    pub fn rate_limited(provider: impl Into<String>, details: impl Into<String>) -> Self {
        Self::RateLimited {
            provider: provider.into(),
            details: details.into(),
        }
    }

    pub fn unauthorized(provider: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Unauthorized {
            provider: provider.into(),
            details: details.into(),
        }
    }

    pub fn upstream(provider: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Upstream {
            provider: provider.into(),
            details: details.into(),
        }
    }

    pub fn timeout(provider: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            provider: provider.into(),
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Map an HTTP status from a provider response onto a transport error.
    pub fn from_status(
        provider: impl Into<String>,
        status_code: u16,
        details: impl Into<String>,
    ) -> Self {
        match status_code {
            429 => Self::rate_limited(provider, details),
            401 | 403 => Self::unauthorized(provider, details),
            _ => Self::upstream(provider, format!("status {status_code}: {}", details.into())),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        match self {
            Self::RateLimited { .. } => TransportErrorKind::RateLimited,
            Self::Unauthorized { .. } => TransportErrorKind::Unauthorized,
            Self::Timeout { .. } | Self::Upstream { .. } => TransportErrorKind::Other,
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::RateLimited { provider, .. }
            | Self::Unauthorized { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Upstream { provider, .. } => provider,
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind(), TransportErrorKind::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(429, TransportErrorKind::RateLimited)]
    #[case(401, TransportErrorKind::Unauthorized)]
    #[case(403, TransportErrorKind::Unauthorized)]
    #[case(500, TransportErrorKind::Other)]
    #[case(529, TransportErrorKind::Other)]
    fn status_codes_map_to_kinds(#[case] status: u16, #[case] kind: TransportErrorKind) {
        assert_eq!(TransportError::from_status("test", status, "body").kind(), kind);
    }

    #[test]
    fn unauthorized_is_not_retryable() {
        assert!(!TransportError::unauthorized("test", "bad key").is_retryable());
        assert!(TransportError::rate_limited("test", "slow down").is_retryable());
        assert!(TransportError::timeout("test", Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn timeout_reports_milliseconds() {
        let err = TransportError::timeout("openai", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Request to openai timed out after 1500ms");
        assert_eq!(err.provider(), "openai");
    }
}
