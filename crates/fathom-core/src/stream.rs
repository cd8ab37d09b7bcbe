//! Pull-based progress streams for stream-bearing nodes.
//!
//! An [`EventStream`] wraps the producer of one stage. The producer only runs
//! while the consumer polls, so pacing is entirely consumer driven. The stage
//! outcome the driver needs is written into a shared slot; it becomes visible
//! to the driver only once the consumer has observed the stage's terminal
//! event (or the stream ran to its end).

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::api::{CompletionResponse, TransportError};
use fathom_tools::{ToolCall, ToolResult};

/// Observable progress of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Incremental model text.
    TextDelta { text: String },
    /// Terminal event of a model stage.
    FinalResult { output: CompletionResponse },
    ToolCallRequested {
        call_id: String,
        name: String,
        args: Value,
    },
    ToolCallCompleted { call_id: String, result: ToolResult },
}

impl Event {
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Event::ToolCallRequested { call_id, .. } | Event::ToolCallCompleted { call_id, .. } => {
                Some(call_id)
            }
            Event::TextDelta { .. } | Event::FinalResult { .. } => None,
        }
    }
}

/// Result of a tool call, in the order the model requested it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub call: ToolCall,
    pub result: ToolResult,
}

pub(crate) type ModelOutcome = Result<CompletionResponse, TransportError>;

#[derive(Debug)]
enum SlotState<T> {
    Pending,
    /// Outcome known, terminal event not yet seen by the consumer.
    Ready(T),
    Delivered(T),
    Taken,
    Cancelled,
}

/// What the driver sees when it resolves a stage.
#[derive(Debug)]
pub(crate) enum StageStatus<T> {
    InProgress,
    Delivered(T),
    Cancelled,
}

/// Stage outcome shared between a producer and the driver.
#[derive(Debug)]
pub(crate) struct StageSlot<T> {
    state: Mutex<SlotState<T>>,
}

impl<T> StageSlot<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Pending),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by the producer right before it yields its terminal event.
    pub(crate) fn set_ready(&self, outcome: T) {
        let mut state = self.lock();
        if matches!(*state, SlotState::Pending) {
            *state = SlotState::Ready(outcome);
        }
    }

    /// Hand the delivered outcome to the driver, once.
    pub(crate) fn resolve(&self) -> StageStatus<T> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Delivered(outcome) => StageStatus::Delivered(outcome),
            SlotState::Cancelled | SlotState::Taken => {
                *state = SlotState::Cancelled;
                StageStatus::Cancelled
            }
            pending @ (SlotState::Pending | SlotState::Ready(_)) => {
                *state = pending;
                StageStatus::InProgress
            }
        }
    }
}

/// Transitions driven by the consumer side of a stage.
pub(crate) trait SlotControl: Send + Sync {
    /// The consumer has seen an event; if it was the terminal one, deliver.
    fn promote(&self);
    /// The producer ran to its end. A producer that stops without an outcome
    /// bailed out on cancellation.
    fn finish(&self);
    fn cancel(&self);
}

impl<T: Send> SlotControl for StageSlot<T> {
    fn promote(&self) {
        let mut state = self.lock();
        if let SlotState::Ready(_) = &*state {
            if let SlotState::Ready(outcome) = std::mem::replace(&mut *state, SlotState::Taken) {
                *state = SlotState::Delivered(outcome);
            }
        }
    }

    fn finish(&self) {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SlotState::Cancelled) {
            SlotState::Ready(outcome) | SlotState::Delivered(outcome) => {
                *state = SlotState::Delivered(outcome);
            }
            SlotState::Taken => *state = SlotState::Taken,
            SlotState::Pending | SlotState::Cancelled => {}
        }
    }

    fn cancel(&self) {
        let mut state = self.lock();
        if matches!(*state, SlotState::Pending | SlotState::Ready(_)) {
            *state = SlotState::Cancelled;
        }
    }
}

pub(crate) type Producer = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Lazy, single-pass, cancelable sequence of [`Event`]s for one node.
///
/// Dropping the stream before it finished cancels the stage.
pub struct EventStream {
    node_id: String,
    producer: Producer,
    token: CancellationToken,
    slot: Arc<dyn SlotControl>,
    finished: bool,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("node_id", &self.node_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    pub(crate) fn new(
        node_id: String,
        producer: Producer,
        token: CancellationToken,
        slot: Arc<dyn SlotControl>,
    ) -> Self {
        Self {
            node_id,
            producer,
            token,
            slot,
            finished: false,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Stop the stage. No further events are produced, including terminal
    /// ones, unless the terminal event was already returned.
    pub fn cancel(&mut self) {
        self.token.cancel();
        if !self.finished {
            self.slot.cancel();
            self.finished = true;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.token.is_cancelled() {
            this.slot.cancel();
            this.finished = true;
            return Poll::Ready(None);
        }

        match this.producer.as_mut().poll_next(cx) {
            Poll::Ready(Some(event)) => {
                this.slot.promote();
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.slot.finish();
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if !self.finished {
            self.token.cancel();
            self.slot.cancel();
        }
    }
}
