pub mod agent;
pub mod api;
pub mod config;
pub mod conversation;
pub mod delegation;
pub mod deps;
pub mod error;
mod generation;
pub mod logging;
pub mod node;
pub mod session;
pub mod stream;
pub mod test_utils;
pub mod tools;
pub mod usage;

pub use agent::{Agent, AgentBuilder, RunResult};
pub use api::{
    CompletionRequest, CompletionResponse, Provider, StreamChunk, TransportError,
    TransportErrorKind,
};
pub use config::{LoggingConfig, RunConfig};
pub use delegation::{DelegateTool, DelegationBridge};
pub use deps::DependencyBundle;
pub use error::{ConfigurationError, Result, RunError, RunFailure};
pub use node::{FinalOutput, Node, NodeKind};
pub use session::{RunSession, SessionState};
pub use stream::{Event, EventStream, ToolOutcome};
pub use usage::{UnitCounts, UsageAccumulator, UsageCounters};
