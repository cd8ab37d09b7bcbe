pub mod error;
pub mod result;
pub mod schema;
pub mod validation;

pub use error::{FieldViolation, SchemaError, ToolError};
pub use result::{AgentResult, ToolResult};
pub use schema::{ExecutionMode, InputSchema, ToolCall, ToolSchema};
pub use validation::ArgumentValidator;
