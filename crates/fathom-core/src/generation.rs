use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::api::{CompletionRequest, Provider, StreamChunk, TransportError};
use crate::config::RunConfig;
use crate::stream::{Event, ModelOutcome, Producer, StageSlot};

/// Await `fut`, or `None` once `deadline` passes.
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Event producer for one model stage.
///
/// Failing to start the stream is retried for retryable kinds with
/// exponential backoff. Once a stream has started, any failure is final for
/// the stage. The deadline covers one attempt from request to final chunk.
pub(crate) fn model_producer(
    provider: Arc<dyn Provider>,
    request: CompletionRequest,
    config: &RunConfig,
    token: CancellationToken,
    slot: Arc<StageSlot<ModelOutcome>>,
    node_id: &str,
) -> Producer {
    let config = config.clone();
    let node_id = node_id.to_string();

    Box::pin(async_stream::stream! {
        let provider_name = provider.name().to_string();
        let timeout = config.model_timeout();
        let mut attempt = 0u32;

        let (mut chunks, deadline) = loop {
            if token.is_cancelled() {
                return;
            }
            let deadline = timeout.map(|t| Instant::now() + t);

            let started = tokio::select! {
                biased;
                () = token.cancelled() => return,
                started = within(deadline, provider.stream_complete(request.clone(), token.clone())) => started,
            };

            let error = match started {
                Some(Ok(chunks)) => break (chunks, deadline),
                Some(Err(error)) => error,
                None => TransportError::timeout(&provider_name, timeout.unwrap_or(Duration::ZERO)),
            };

            if attempt < config.model_retries && error.is_retryable() {
                attempt += 1;
                let backoff = config.retry_backoff(attempt);
                warn!(
                    error = %error,
                    attempt,
                    max_retries = config.model_retries,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    "Model request failed to start, retrying"
                );
                tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(backoff) => {}
                }
                continue;
            }

            error!(node.id = %node_id, error = %error, kind = %error.kind(), "Model request failed");
            slot.set_ready(Err(error));
            return;
        };

        loop {
            if token.is_cancelled() {
                return;
            }

            let next = tokio::select! {
                biased;
                () = token.cancelled() => return,
                next = within(deadline, chunks.next()) => next,
            };

            match next {
                Some(Some(StreamChunk::TextDelta(text))) => {
                    yield Event::TextDelta { text };
                }
                Some(Some(StreamChunk::MessageComplete(response))) => {
                    debug!(
                        node.id = %node_id,
                        tool_calls = response.extract_tool_calls().len(),
                        "Model stage complete"
                    );
                    slot.set_ready(Ok(response.clone()));
                    yield Event::FinalResult { output: response };
                    return;
                }
                Some(Some(StreamChunk::Error(error))) => {
                    error!(node.id = %node_id, error = %error, kind = %error.kind(), "Model stream failed");
                    slot.set_ready(Err(error));
                    return;
                }
                Some(None) => {
                    let error = TransportError::upstream(
                        &provider_name,
                        "stream ended without a final message",
                    );
                    error!(error = %error, "Model stream truncated");
                    slot.set_ready(Err(error));
                    return;
                }
                None => {
                    let error =
                        TransportError::timeout(&provider_name, timeout.unwrap_or(Duration::ZERO));
                    error!(error = %error, "Model stream timed out");
                    slot.set_ready(Err(error));
                    return;
                }
            }
        }
    })
}
