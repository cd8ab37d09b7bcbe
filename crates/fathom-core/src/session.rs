//! The run-graph driver.
//!
//! A [`RunSession`] moves through `AwaitingPrompt -> Generating ->
//! (Dispatching -> Generating)* -> Done | Failed`, handing the caller one
//! [`Node`] per `advance`. Model and tool stages expose an [`EventStream`]
//! through [`RunSession::open_stream`]; a stage nobody opened is drained
//! internally on the next `advance`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::api::{CompletionRequest, CompletionResponse};
use crate::conversation::Message;
use crate::deps::DependencyBundle;
use crate::error::{RunError, RunFailure};
use crate::generation::model_producer;
use crate::node::{FinalOutput, Node};
use crate::stream::{EventStream, ModelOutcome, StageSlot, StageStatus, ToolOutcome};
use crate::tools::dispatcher::ToolDispatcher;
use crate::tools::handler::ToolContext;
use crate::usage::{UsageAccumulator, UsageCounters};
use fathom_tools::{FieldViolation, ToolCall};

/// Externally visible driver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    AwaitingPrompt,
    Generating,
    Dispatching,
    Done,
    Failed,
}

struct ActiveStage<T> {
    node_id: String,
    /// Present until the caller opens it.
    stream: Option<EventStream>,
    slot: Arc<StageSlot<T>>,
}

enum Phase {
    AwaitingPrompt,
    /// `None` until the next model stage is started.
    Generating(Option<ActiveStage<ModelOutcome>>),
    Dispatching(ActiveStage<Vec<ToolOutcome>>),
    Done,
    Failed,
}

/// Drain an unopened stage, then read its outcome.
///
/// The stream stays in the stage until it is exhausted, so a drain that is
/// interrupted picks up where it stopped on the next call.
async fn settle<T>(stage: &mut ActiveStage<T>) -> StageStatus<T> {
    if let Some(stream) = stage.stream.as_mut() {
        while stream.next().await.is_some() {}
        stage.stream = None;
    }
    stage.slot.resolve()
}

/// Outcome of the active stage, read without leaving its phase.
enum Settled {
    Model(StageStatus<ModelOutcome>),
    Tools(StageStatus<Vec<ToolOutcome>>),
}

/// One end-to-end agent invocation.
pub struct RunSession<D> {
    id: String,
    agent: Agent<D>,
    prompt: String,
    deps: Arc<D>,
    history: Vec<Message>,
    usage: UsageAccumulator,
    dispatcher: ToolDispatcher<D>,
    phase: Phase,
    token: CancellationToken,
    dispatched: HashSet<String>,
    model_requests: u32,
    output_retries: u32,
    last_recoverable_error: Option<String>,
    result: Option<Result<FinalOutput, RunFailure>>,
}

impl<D> fmt::Debug for RunSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunSession")
            .field("id", &self.id)
            .field("agent", &self.agent.inner.name)
            .field("model_requests", &self.model_requests)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

impl<D: DependencyBundle> RunSession<D> {
    pub(crate) fn new(agent: Agent<D>, prompt: String, deps: Arc<D>, token: CancellationToken) -> Self {
        let config = &agent.inner.config;
        let dispatcher = ToolDispatcher::new(
            Arc::clone(&agent.inner.registry),
            config.tool_timeout(),
            config.max_concurrent_tools,
        );
        let id = Uuid::now_v7().to_string();
        debug!(session.id = %id, agent = %agent.inner.name, "Session created");

        Self {
            id,
            agent,
            prompt,
            deps,
            history: Vec::new(),
            usage: UsageAccumulator::new(),
            dispatcher,
            phase: Phase::AwaitingPrompt,
            token,
            dispatched: HashSet::new(),
            model_requests: 0,
            output_retries: 0,
            last_recoverable_error: None,
            result: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent.inner.name
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn deps(&self) -> &Arc<D> {
        &self.deps
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn into_history(self) -> Vec<Message> {
        self.history
    }

    /// Snapshot of this session's usage, including merged delegations.
    pub fn usage(&self) -> UsageCounters {
        self.usage.snapshot()
    }

    /// Live handle to this session's counters.
    pub(crate) fn usage_handle(&self) -> UsageAccumulator {
        self.usage.clone()
    }

    /// Terminal result once the end node was produced.
    pub fn result(&self) -> Option<&Result<FinalOutput, RunFailure>> {
        self.result.as_ref()
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::AwaitingPrompt => SessionState::AwaitingPrompt,
            Phase::Generating(_) => SessionState::Generating,
            Phase::Dispatching(_) => SessionState::Dispatching,
            Phase::Done => SessionState::Done,
            Phase::Failed => SessionState::Failed,
        }
    }

    /// Available permits in this session's tool pool.
    pub fn available_tool_permits(&self) -> usize {
        self.dispatcher.available_permits()
    }

    /// Cancel the session. The active stage stops at its next boundary and
    /// the next `advance` returns an end node with [`RunFailure::Cancelled`].
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Produce the next node.
    ///
    /// The previous stage must be finished: either its stream was consumed to
    /// its terminal event, or it was never opened (then it is drained here).
    /// A stream that is still open yields [`RunError::StageInProgress`].
    #[instrument(skip_all, name = "RunSession::advance", fields(session.id = %self.id))]
    pub async fn advance(&mut self) -> Result<Node, RunError> {
        // Stages settle in place: dropping this future mid-drain keeps the
        // session in its current phase.
        let settled = match &mut self.phase {
            Phase::Generating(Some(stage)) => Some(Settled::Model(settle(stage).await)),
            Phase::Dispatching(stage) => Some(Settled::Tools(settle(stage).await)),
            _ => None,
        };

        match settled {
            Some(Settled::Model(StageStatus::InProgress) | Settled::Tools(StageStatus::InProgress)) => {
                Err(RunError::StageInProgress {
                    node_id: self.active_node_id().unwrap_or_default(),
                })
            }
            Some(Settled::Model(StageStatus::Cancelled) | Settled::Tools(StageStatus::Cancelled)) => {
                Ok(self.fail(RunFailure::Cancelled))
            }
            Some(Settled::Model(StageStatus::Delivered(Err(error)))) => Ok(self.fail(error.into())),
            Some(Settled::Model(StageStatus::Delivered(Ok(response)))) => {
                Ok(self.after_generation(response))
            }
            Some(Settled::Tools(StageStatus::Delivered(outcomes))) => {
                self.record_tool_outcomes(outcomes);
                Ok(self.start_generation())
            }
            None => self.advance_idle(),
        }
    }

    /// Transitions that do not wait on a stage.
    fn advance_idle(&mut self) -> Result<Node, RunError> {
        match self.phase {
            Phase::Done | Phase::Failed => Err(RunError::SessionFinished {
                session_id: self.id.clone(),
            }),
            Phase::AwaitingPrompt => {
                let message = Message::user(self.prompt.clone(), self.history.last());
                self.history.push(message);
                self.phase = Phase::Generating(None);
                debug!("Prompt received");
                Ok(Node::UserPrompt {
                    prompt: self.prompt.clone(),
                })
            }
            Phase::Generating(_) | Phase::Dispatching(_) => Ok(self.start_generation()),
        }
    }

    fn active_node_id(&self) -> Option<String> {
        match &self.phase {
            Phase::Generating(Some(stage)) => Some(stage.node_id.clone()),
            Phase::Dispatching(stage) => Some(stage.node_id.clone()),
            _ => None,
        }
    }

    /// Take the event stream of a stream-bearing node. Each stream can be
    /// opened once, and only while its node is the active one.
    pub fn open_stream(&mut self, node: &Node) -> Result<EventStream, RunError> {
        let Some(node_id) = node.id() else {
            return Err(RunError::StreamUnavailable {
                node_id: node.kind().to_string(),
            });
        };

        let stream = match &mut self.phase {
            Phase::Generating(Some(stage)) if stage.node_id == node_id => stage.stream.take(),
            Phase::Dispatching(stage) if stage.node_id == node_id => stage.stream.take(),
            _ => None,
        };

        stream.ok_or_else(|| RunError::StreamUnavailable {
            node_id: node_id.to_string(),
        })
    }

    /// Advance until the end node and return its result.
    pub async fn run_to_end(&mut self) -> Result<FinalOutput, RunError> {
        loop {
            if let Node::End { result } = self.advance().await? {
                return result.map_err(RunError::from);
            }
        }
    }

    fn start_generation(&mut self) -> Node {
        if self.token.is_cancelled() {
            return self.fail(RunFailure::Cancelled);
        }
        let limit = self.agent.inner.config.max_model_requests;
        if self.model_requests >= limit {
            return self.fail(RunFailure::RequestLimitExceeded { limit });
        }
        self.model_requests += 1;

        let node_id = Message::generate_id("model");
        let request = CompletionRequest {
            system: self.agent.request_system_prompt(&self.deps),
            messages: self.history.clone(),
            tools: self.agent.inner.registry.schemas(),
        };

        let stage_token = self.token.child_token();
        let slot = StageSlot::new();
        let producer = model_producer(
            Arc::clone(&self.agent.inner.provider),
            request,
            &self.agent.inner.config,
            stage_token.clone(),
            Arc::clone(&slot),
            &node_id,
        );
        let stream = EventStream::new(node_id.clone(), producer, stage_token, slot.clone());

        debug!(node.id = %node_id, request = self.model_requests, "Model stage started");
        self.phase = Phase::Generating(Some(ActiveStage {
            node_id: node_id.clone(),
            stream: Some(stream),
            slot,
        }));

        Node::ModelRequest {
            id: node_id,
            request: self.model_requests,
        }
    }

    fn after_generation(&mut self, response: CompletionResponse) -> Node {
        if let Some(units) = response.usage {
            self.usage.record(&self.agent.inner.name, units);
        }

        let message = Message::assistant(response.content.clone(), self.history.last());
        self.history.push(message);

        if response.has_tool_calls() {
            let calls: Vec<ToolCall> = response
                .extract_tool_calls()
                .into_iter()
                .filter(|call| {
                    let fresh = !self.dispatched.contains(&call.id);
                    if !fresh {
                        warn!(tool.id = %call.id, "Tool call id was already dispatched, skipping");
                    }
                    fresh
                })
                .collect();
            self.dispatched.extend(calls.iter().map(|c| c.id.clone()));
            return self.start_dispatch(calls);
        }

        let text = response.extract_text();
        match self.check_output(&text) {
            Ok(data) => self.finish(text, data),
            Err(violations) => {
                let summary = violations
                    .iter()
                    .map(|v| format!("- {v}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let error_text = format!("Output validation failed:\n{summary}");
                self.last_recoverable_error = Some(error_text.clone());

                if self.output_retries < self.agent.inner.config.output_retries {
                    self.output_retries += 1;
                    warn!(
                        attempt = self.output_retries,
                        "Final output did not match the output schema, asking again"
                    );
                    let retry = Message::user(
                        format!(
                            "Your response did not match the required output schema:\n{summary}\nRespond again with only the JSON value."
                        ),
                        self.history.last(),
                    );
                    self.history.push(retry);
                    self.start_generation()
                } else {
                    warn!("Output retries exhausted");
                    self.finish(error_text, None)
                }
            }
        }
    }

    fn start_dispatch(&mut self, calls: Vec<ToolCall>) -> Node {
        let node_id = Message::generate_id("tools");
        let stage_token = self.token.child_token();
        let slot = StageSlot::new();
        let base = ToolContext::new(
            self.id.clone(),
            self.agent.inner.name.clone(),
            Arc::clone(&self.deps),
            self.usage.clone(),
            stage_token.clone(),
        );
        let producer =
            self.dispatcher
                .batch_producer(calls.clone(), base, stage_token.clone(), Arc::clone(&slot));
        let stream = EventStream::new(node_id.clone(), producer, stage_token, slot.clone());

        debug!(node.id = %node_id, calls = calls.len(), "Tool stage started");
        self.phase = Phase::Dispatching(ActiveStage {
            node_id: node_id.clone(),
            stream: Some(stream),
            slot,
        });

        Node::ToolCall { id: node_id, calls }
    }

    fn record_tool_outcomes(&mut self, outcomes: Vec<ToolOutcome>) {
        for ToolOutcome { call, result } in outcomes {
            if let Some(error) = result.error() {
                self.last_recoverable_error = Some(error.to_string());
            }
            let message = Message::tool(call.id, result, self.history.last());
            self.history.push(message);
        }
    }

    fn check_output(&self, text: &str) -> Result<Option<Value>, Vec<FieldViolation>> {
        let Some(output) = &self.agent.inner.output else {
            return Ok(None);
        };
        let value: Value = serde_json::from_str(strip_code_fence(text))
            .map_err(|e| vec![FieldViolation::new("$", format!("not valid JSON: {e}"))])?;
        output.validator.validate(&value)?;
        Ok(Some(value))
    }

    fn finish(&mut self, text: String, data: Option<Value>) -> Node {
        let text = match (&self.last_recoverable_error, text.trim().is_empty()) {
            (Some(error), true) => error.clone(),
            _ => text,
        };
        let output = FinalOutput { text, data };
        info!(
            model_requests = self.model_requests,
            total_units = self.usage.snapshot().total_units(),
            "Session done"
        );
        self.phase = Phase::Done;
        self.result = Some(Ok(output.clone()));
        Node::End { result: Ok(output) }
    }

    fn fail(&mut self, failure: RunFailure) -> Node {
        warn!(cause = %failure, "Session failed");
        self.phase = Phase::Failed;
        self.result = Some(Err(failure.clone()));
        Node::End {
            result: Err(failure),
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map_or(trimmed, str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json {\"a\":1}"), "```json {\"a\":1}");
    }
}
