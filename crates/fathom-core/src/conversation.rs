//! Turn history for one session.
//!
//! - `Message` - one turn with id, parent link and timestamp
//! - `MessageData` - role-specific content (User, Assistant, Tool)

use std::time::{SystemTime, UNIX_EPOCH};

use fathom_tools::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// Role in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Content that can be sent by an assistant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantContent {
    Text { text: String },
    ToolCall { tool_call: ToolCall },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub timestamp: u64,
    pub id: String,
    pub parent_message_id: Option<String>,
    pub data: MessageData,
}

/// A message in the conversation, with role-specific content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageData {
    User {
        content: String,
    },
    Assistant {
        content: Vec<AssistantContent>,
    },
    Tool {
        tool_use_id: String,
        result: ToolResult,
    },
}

impl Message {
    fn with_data(prefix: &str, data: MessageData, parent: Option<&Message>) -> Self {
        Self {
            timestamp: Self::current_timestamp(),
            id: Self::generate_id(prefix),
            parent_message_id: parent.map(|m| m.id.clone()),
            data,
        }
    }

    pub fn user(text: impl Into<String>, parent: Option<&Message>) -> Self {
        Self::with_data(
            "user",
            MessageData::User {
                content: text.into(),
            },
            parent,
        )
    }

    pub fn assistant(content: Vec<AssistantContent>, parent: Option<&Message>) -> Self {
        Self::with_data("assistant", MessageData::Assistant { content }, parent)
    }

    pub fn tool(
        tool_use_id: impl Into<String>,
        result: ToolResult,
        parent: Option<&Message>,
    ) -> Self {
        Self::with_data(
            "tool",
            MessageData::Tool {
                tool_use_id: tool_use_id.into(),
                result,
            },
            parent,
        )
    }

    pub fn role(&self) -> Role {
        match &self.data {
            MessageData::User { .. } => Role::User,
            MessageData::Assistant { .. } => Role::Assistant,
            MessageData::Tool { .. } => Role::Tool,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_message_id(&self) -> Option<&str> {
        self.parent_message_id.as_deref()
    }

    /// Helper to get current timestamp
    pub fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Helper to generate unique IDs
    pub fn generate_id(prefix: &str) -> String {
        format!("{}_{}", prefix, Uuid::now_v7())
    }

    /// Tool calls requested by an assistant turn, in request order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        match &self.data {
            MessageData::Assistant { content } => content
                .iter()
                .filter_map(|c| match c {
                    AssistantContent::ToolCall { tool_call } => Some(tool_call),
                    AssistantContent::Text { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Extract text content from the message
    pub fn extract_text(&self) -> String {
        match &self.data {
            MessageData::User { content } => content.clone(),
            MessageData::Assistant { content } => content
                .iter()
                .filter_map(|c| match c {
                    AssistantContent::Text { text } => Some(text.as_str()),
                    AssistantContent::ToolCall { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            MessageData::Tool { result, .. } => result.llm_format(),
        }
    }
}
