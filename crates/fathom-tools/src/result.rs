use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

/// Outcome of one tool call as recorded in turn history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ToolResult {
    /// Handler output, serialized to JSON.
    Output(Value),
    /// Final report of a delegated agent run.
    Agent(AgentResult),
    /// Failure (any tool)
    Error(ToolError),
}

/// Result for a delegated agent run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub agent: String,
    pub session_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Error(_))
    }

    pub fn error(&self) -> Option<&ToolError> {
        match self {
            ToolResult::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Text handed back to the model on its next turn.
    pub fn llm_format(&self) -> String {
        match self {
            ToolResult::Output(Value::String(text)) => text.clone(),
            ToolResult::Output(value) => value.to_string(),
            ToolResult::Agent(result) => result.content.clone(),
            ToolResult::Error(err) => format!("Error: {err}"),
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        ToolResult::Error(err)
    }
}

impl From<Result<ToolResult, ToolError>> for ToolResult {
    fn from(result: Result<ToolResult, ToolError>) -> Self {
        result.unwrap_or_else(ToolResult::Error)
    }
}
