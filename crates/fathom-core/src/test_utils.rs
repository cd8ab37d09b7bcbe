//! Model backends for tests.
//!
//! Compiled unconditionally so integration tests and downstream crates can
//! drive agents without a network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;

use crate::api::{
    CompletionRequest, CompletionResponse, CompletionStream, Provider, StreamChunk,
    TransportError,
};
use crate::conversation::AssistantContent;
use crate::usage::UnitCounts;
use fathom_tools::ToolCall;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream `deltas`, then complete with `response`.
    Respond {
        deltas: Vec<String>,
        response: CompletionResponse,
    },
    /// The request fails before any chunk.
    FailToStart(TransportError),
    /// Stream `deltas`, then fail.
    FailMidStream {
        deltas: Vec<String>,
        error: TransportError,
    },
    /// Stream `deltas`, then never produce another chunk.
    Stall { deltas: Vec<String> },
}

impl ScriptedTurn {
    /// Plain text answer streamed word by word.
    pub fn text(text: &str) -> Self {
        Self::text_with_usage(text, UnitCounts::default())
    }

    pub fn text_with_usage(text: &str, usage: UnitCounts) -> Self {
        let deltas = text
            .split_inclusive(' ')
            .map(ToString::to_string)
            .collect();
        Self::Respond {
            deltas,
            response: CompletionResponse::text(text).with_usage(usage),
        }
    }

    /// Turn requesting `calls`, with no text.
    pub fn tool_calls(calls: Vec<ToolCall>, usage: UnitCounts) -> Self {
        Self::Respond {
            deltas: Vec::new(),
            response: CompletionResponse {
                content: calls
                    .into_iter()
                    .map(|tool_call| AssistantContent::ToolCall { tool_call })
                    .collect(),
                usage: Some(usage),
            },
        }
    }
}

/// Replays [`ScriptedTurn`]s in order and records every request.
#[derive(Debug)]
pub struct ScriptedModel {
    name: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self::named("scripted", turns)
    }

    pub fn named(name: impl Into<String>, turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            name: name.into(),
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(turns: impl IntoIterator<Item = ScriptedTurn>) -> Arc<Self> {
        Arc::new(Self::new(turns))
    }

    pub fn push(&self, turn: ScriptedTurn) {
        lock(&self.turns).push_back(turn);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn remaining_turns(&self) -> usize {
        lock(&self.turns).len()
    }
}

fn deltas(deltas: Vec<String>) -> impl Iterator<Item = StreamChunk> {
    deltas.into_iter().map(StreamChunk::TextDelta)
}

#[async_trait]
impl Provider for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_complete(
        &self,
        request: CompletionRequest,
        _token: CancellationToken,
    ) -> Result<CompletionStream, TransportError> {
        lock(&self.requests).push(request);
        let turn = lock(&self.turns).pop_front();

        match turn {
            None => Err(TransportError::upstream(&self.name, "script exhausted")),
            Some(ScriptedTurn::FailToStart(error)) => Err(error),
            Some(ScriptedTurn::Respond {
                deltas: text,
                response,
            }) => Ok(Box::pin(stream::iter(
                deltas(text).chain(std::iter::once(StreamChunk::MessageComplete(response))),
            ))),
            Some(ScriptedTurn::FailMidStream {
                deltas: text,
                error,
            }) => Ok(Box::pin(stream::iter(
                deltas(text).chain(std::iter::once(StreamChunk::Error(error))),
            ))),
            Some(ScriptedTurn::Stall { deltas: text }) => Ok(Box::pin(
                stream::iter(deltas(text)).chain(stream::pending()),
            )),
        }
    }
}

type ResponderFn =
    dyn Fn(&CompletionRequest) -> Result<CompletionResponse, TransportError> + Send + Sync;

/// Computes each response from the request.
pub struct FunctionModel {
    name: String,
    respond: Box<ResponderFn>,
}

impl std::fmt::Debug for FunctionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionModel")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl FunctionModel {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: "function".to_string(),
            respond: Box::new(respond),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Provider for FunctionModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_complete(
        &self,
        request: CompletionRequest,
        _token: CancellationToken,
    ) -> Result<CompletionStream, TransportError> {
        let response = (self.respond)(&request)?;
        let text = response.extract_text();
        let mut chunks = Vec::new();
        if !text.is_empty() {
            chunks.push(StreamChunk::TextDelta(text));
        }
        chunks.push(StreamChunk::MessageComplete(response));
        Ok(Box::pin(stream::iter(chunks)))
    }
}
