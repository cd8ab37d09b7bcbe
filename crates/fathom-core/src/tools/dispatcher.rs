use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, instrument, warn};

use super::handler::ToolContext;
use super::registry::ToolRegistry;
use crate::stream::{Event, Producer, StageSlot, ToolOutcome};
use fathom_tools::{ExecutionMode, ToolCall, ToolError, ToolResult};

/// Runs model-requested tool calls against a registry.
///
/// The dispatcher is the one place handler failures are caught: unknown
/// names, invalid arguments, handler errors, panics and timeouts all come
/// back as [`ToolResult::Error`].
pub struct ToolDispatcher<D> {
    registry: Arc<ToolRegistry<D>>,
    tool_timeout: Option<Duration>,
    permits: Arc<Semaphore>,
}

impl<D> Clone for ToolDispatcher<D> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            tool_timeout: self.tool_timeout,
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<D: Send + Sync + 'static> ToolDispatcher<D> {
    pub fn new(
        registry: Arc<ToolRegistry<D>>,
        tool_timeout: Option<Duration>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            registry,
            tool_timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn registry(&self) -> &ToolRegistry<D> {
        &self.registry
    }

    /// Permits currently free for non-blocking handlers.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn mode_of(&self, name: &str) -> ExecutionMode {
        self.registry
            .get(name)
            .map_or(ExecutionMode::Blocking, |r| r.mode)
    }

    /// Resolve one call. The handler runs at most once and only with
    /// arguments that passed the registered schema.
    #[instrument(skip_all, name = "ToolDispatcher::dispatch", fields(tool.name = %call.name, tool.id = %call.id))]
    pub async fn dispatch(&self, call: &ToolCall, ctx: ToolContext<D>) -> ToolResult {
        let Some(registration) = self.registry.get(&call.name) else {
            warn!(tool_name = %call.name, "Model requested an unknown tool");
            return ToolError::unknown_tool(&call.name).into();
        };

        if let Err(fields) = registration.validator.validate(&call.parameters) {
            warn!(
                invalid_fields = ?fields.iter().map(|f| f.field.as_str()).collect::<Vec<_>>(),
                "Tool arguments failed validation"
            );
            return ToolError::validation(&call.name, fields).into();
        }

        let token = ctx.cancellation_token.clone();
        let handler = Arc::clone(&registration.handler);
        let invocation = AssertUnwindSafe(handler.invoke(call.parameters.clone(), ctx)).catch_unwind();
        let tool_timeout = self.tool_timeout;

        let outcome = tokio::select! {
            biased;

            () = token.cancelled() => {
                debug!("Tool call cancelled");
                return ToolError::Cancelled { tool_name: call.name.clone() }.into();
            }

            outcome = async {
                match tool_timeout {
                    Some(limit) => tokio::time::timeout(limit, invocation).await.map_err(|_| limit),
                    None => Ok(invocation.await),
                }
            } => outcome,
        };

        match outcome {
            Ok(Ok(Ok(result))) => {
                debug!(is_error = result.is_error(), "Tool call finished");
                result
            }
            Ok(Ok(Err(error))) => {
                warn!(error = %error, "Tool handler failed");
                error.into()
            }
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                warn!(panic = %message, "Tool handler panicked");
                ToolError::execution(&call.name, message).into()
            }
            Err(limit) => {
                let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                warn!(timeout_ms, "Tool call timed out");
                ToolError::Timeout {
                    tool_name: call.name.clone(),
                    timeout_ms,
                }
                .into()
            }
        }
    }

    /// Event producer for one tool node.
    ///
    /// Emits `ToolCallRequested` for each call before it starts. Blocking
    /// calls finish before the next call starts; non-blocking calls run on a
    /// join set, bounded by the permit pool, and are all joined before the
    /// stream ends. Cancellation is checked before each call starts. Calls
    /// aborted by cancellation produce no `ToolCallCompleted`.
    pub(crate) fn batch_producer(
        &self,
        calls: Vec<ToolCall>,
        base: ToolContext<D>,
        token: CancellationToken,
        slot: Arc<StageSlot<Vec<ToolOutcome>>>,
    ) -> Producer {
        let dispatcher = self.clone();

        Box::pin(async_stream::stream! {
            let mut seen = HashSet::new();
            let calls: Vec<ToolCall> = calls
                .into_iter()
                .filter(|call| {
                    let fresh = seen.insert(call.id.clone());
                    if !fresh {
                        warn!(tool.id = %call.id, "Skipping duplicate tool call id");
                    }
                    fresh
                })
                .collect();

            let total = calls.len();
            let mut results: Vec<Option<ToolResult>> = vec![None; total];
            let mut completed = 0usize;

            if total == 0 {
                slot.set_ready(Vec::new());
                return;
            }

            let mut pending: JoinSet<(usize, ToolResult)> = JoinSet::new();
            let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();

            for (index, call) in calls.iter().enumerate() {
                if token.is_cancelled() {
                    debug!("Tool node cancelled before starting {}", call.id);
                    pending.abort_all();
                    return;
                }

                yield Event::ToolCallRequested {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.parameters.clone(),
                };

                let ctx = base.for_call(&call.id, token.child_token());

                match dispatcher.mode_of(&call.name) {
                    ExecutionMode::Blocking => {
                        let result = dispatcher.dispatch(call, ctx).await;
                        if token.is_cancelled() {
                            pending.abort_all();
                            return;
                        }
                        completed += 1;
                        results[index] = Some(result.clone());
                        if completed == total {
                            slot.set_ready(collect_outcomes(&calls, &mut results));
                        }
                        yield Event::ToolCallCompleted { call_id: call.id.clone(), result };
                    }
                    ExecutionMode::NonBlocking => {
                        let task_dispatcher = dispatcher.clone();
                        let permits = Arc::clone(&dispatcher.permits);
                        let task_call = call.clone();
                        let span = info_span!("tool_task", tool.name = %call.name, tool.id = %call.id);
                        let handle = pending.spawn(
                            async move {
                                // Held until the handler resolves or the task is aborted.
                                let Ok(_permit) = permits.acquire_owned().await else {
                                    return (
                                        index,
                                        ToolError::Cancelled { tool_name: task_call.name.clone() }.into(),
                                    );
                                };
                                (index, task_dispatcher.dispatch(&task_call, ctx).await)
                            }
                            .instrument(span),
                        );
                        task_index.insert(handle.id(), index);
                    }
                }
            }

            while let Some(joined) = pending.join_next_with_id().await {
                if token.is_cancelled() {
                    pending.abort_all();
                    return;
                }

                let (index, result) = match joined {
                    Ok((_, (index, result))) => (index, result),
                    Err(join_error) => {
                        let Some(&index) = task_index.get(&join_error.id()) else {
                            warn!(error = %join_error, "Lost track of a tool task");
                            continue;
                        };
                        let name = calls[index].name.clone();
                        (index, ToolError::execution(name, join_error.to_string()).into())
                    }
                };

                completed += 1;
                results[index] = Some(result.clone());
                if completed == total {
                    slot.set_ready(collect_outcomes(&calls, &mut results));
                }
                yield Event::ToolCallCompleted { call_id: calls[index].id.clone(), result };
            }
        })
    }
}

fn collect_outcomes(calls: &[ToolCall], results: &mut [Option<ToolResult>]) -> Vec<ToolOutcome> {
    calls
        .iter()
        .zip(results.iter_mut())
        .filter_map(|(call, result)| {
            result.take().map(|result| ToolOutcome {
                call: call.clone(),
                result,
            })
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
