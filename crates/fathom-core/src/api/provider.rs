use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::api::error::TransportError;
use crate::conversation::{AssistantContent, Message};
use crate::usage::UnitCounts;
use fathom_tools::{ToolCall, ToolSchema};

/// Response from the provider's completion API
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionResponse {
    pub content: Vec<AssistantContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UnitCounts>,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![AssistantContent::Text { text: text.into() }],
            usage: None,
        }
    }

    #[must_use]
    pub fn with_usage(mut self, usage: UnitCounts) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Extract all text content from the response
    pub fn extract_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| {
                if let AssistantContent::Text { text } = block {
                    Some(text.clone())
                } else {
                    None
                }
            })
            .collect::<Vec<String>>()
            .join("")
    }

    /// Check if the response contains any tool calls
    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, AssistantContent::ToolCall { .. }))
    }

    pub fn extract_tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|block| {
                if let AssistantContent::ToolCall { tool_call } = block {
                    Some(tool_call.clone())
                } else {
                    None
                }
            })
            .collect()
    }
}

/// One fragment of a streamed completion, decoded once at the provider
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    /// Terminal chunk carrying the full structured response.
    MessageComplete(CompletionResponse),
    Error(TransportError),
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Everything a model backend needs to produce the next assistant turn.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

/// Model backend. Implementations own the wire protocol; the driver only sees
/// [`StreamChunk`]s.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Get the name of the provider
    fn name(&self) -> &str;

    /// Start a streamed completion. An `Err` here means the stream never
    /// started and the request may be retried.
    async fn stream_complete(
        &self,
        request: CompletionRequest,
        token: CancellationToken,
    ) -> Result<CompletionStream, TransportError>;

    /// Complete a request without observing deltas.
    async fn complete(
        &self,
        request: CompletionRequest,
        token: CancellationToken,
    ) -> Result<CompletionResponse, TransportError> {
        let mut stream = self.stream_complete(request, token).await?;
        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::TextDelta(_) => {}
                StreamChunk::MessageComplete(response) => return Ok(response),
                StreamChunk::Error(err) => return Err(err),
            }
        }
        Err(TransportError::upstream(
            self.name(),
            "stream ended without a final message",
        ))
    }
}
