use crate::error::ConfigurationError;

/// Caller-defined dependencies made available to tool handlers.
///
/// The core never inspects a bundle beyond calling [`validate`] once when a
/// session starts. Handlers reach it through `ToolContext::deps`.
///
/// [`validate`]: DependencyBundle::validate
pub trait DependencyBundle: Send + Sync + 'static {
    fn validate(&self) -> Result<(), ConfigurationError> {
        Ok(())
    }
}

impl DependencyBundle for () {}
