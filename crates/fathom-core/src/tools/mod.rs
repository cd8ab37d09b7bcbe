pub mod dispatcher;
pub mod handler;
pub mod registry;

pub use dispatcher::ToolDispatcher;
pub use handler::{FnHandler, Tool, ToolContext, ToolHandler, handler_fn, schema_for};
pub use registry::{RegistryError, ToolRegistration, ToolRegistry};
