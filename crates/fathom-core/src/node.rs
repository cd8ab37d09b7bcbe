use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::error::RunFailure;
use fathom_tools::ToolCall;

/// What a session produced when it reached `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalOutput {
    pub text: String,
    /// Parsed output when the agent declares an output schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl FinalOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: None,
        }
    }
}

/// One stage of a session, returned by `RunSession::advance`.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    UserPrompt {
        prompt: String,
    },
    /// Generation stage; its stream ends with `Event::FinalResult`.
    ModelRequest {
        id: String,
        /// 1-based count of model requests in this session.
        request: u32,
    },
    /// Dispatch stage for the calls the previous model turn requested.
    ToolCall {
        id: String,
        calls: Vec<ToolCall>,
    },
    End {
        result: Result<FinalOutput, RunFailure>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum NodeKind {
    UserPrompt,
    ModelRequest,
    ToolCall,
    End,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::UserPrompt { .. } => NodeKind::UserPrompt,
            Node::ModelRequest { .. } => NodeKind::ModelRequest,
            Node::ToolCall { .. } => NodeKind::ToolCall,
            Node::End { .. } => NodeKind::End,
        }
    }

    /// Id of a stream-bearing node.
    pub fn id(&self) -> Option<&str> {
        match self {
            Node::ModelRequest { id, .. } | Node::ToolCall { id, .. } => Some(id),
            Node::UserPrompt { .. } | Node::End { .. } => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Node::End { .. })
    }
}
