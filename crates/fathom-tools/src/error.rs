use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One argument that failed schema validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldViolation {
    /// Dotted path of the offending field, `$` for the argument object itself.
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_violations(fields: &[FieldViolation]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Recoverable tool failures. Every variant is reported back to the model as
/// a tool result; none of them terminates a session.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Invalid arguments for {tool_name}: {}", join_violations(.fields))]
    Validation {
        tool_name: String,
        fields: Vec<FieldViolation>,
    },

    #[error("{tool_name} failed: {message}")]
    Execution { tool_name: String, message: String },

    #[error("{tool_name} timed out after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("{tool_name} was cancelled")]
    Cancelled { tool_name: String },

    #[error("Delegation to {agent} failed: {message}")]
    Delegation { agent: String, message: String },
}

impl ToolError {
    pub fn unknown_tool(name: impl Into<String>) -> Self {
        ToolError::UnknownTool { name: name.into() }
    }

    pub fn execution<T: Into<String>, M: Into<String>>(tool_name: T, message: M) -> Self {
        ToolError::Execution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn validation(tool_name: impl Into<String>, fields: Vec<FieldViolation>) -> Self {
        ToolError::Validation {
            tool_name: tool_name.into(),
            fields,
        }
    }

    /// Names of the offending fields for a validation failure, empty otherwise.
    pub fn invalid_fields(&self) -> Vec<&str> {
        match self {
            ToolError::Validation { fields, .. } => {
                fields.iter().map(|f| f.field.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Raised when a declared argument schema cannot be compiled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid argument schema: {details}")]
pub struct SchemaError {
    pub details: String,
}
