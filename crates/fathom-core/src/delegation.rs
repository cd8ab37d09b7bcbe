//! Running a nested agent as a tool.
//!
//! The nested session is fully independent: its own id, history, dependency
//! bundle and counters. Only its final output (or failure) comes back, as a
//! tool result, and its usage is merged into the calling session exactly
//! once, whether it succeeded, failed, or was cut short by the parent's
//! timeout or cancellation.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::agent::Agent;
use crate::deps::DependencyBundle;
use crate::tools::handler::{ToolContext, ToolHandler, schema_for};
use crate::usage::{UsageAccumulator, UsageCounters};
use fathom_tools::{AgentResult, ToolError, ToolResult, ToolSchema};

pub struct DelegationBridge<N> {
    agent: Agent<N>,
}

impl<N> Clone for DelegationBridge<N> {
    fn clone(&self) -> Self {
        Self {
            agent: self.agent.clone(),
        }
    }
}

impl<N: DependencyBundle> DelegationBridge<N> {
    pub fn new(agent: Agent<N>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Agent<N> {
        &self.agent
    }

    /// Run one nested session to completion on behalf of `parent`.
    ///
    /// Never fails: a nested failure, including a rejected dependency bundle,
    /// is returned as [`ToolError::Delegation`] so the parent model can react.
    #[instrument(
        skip_all,
        name = "DelegationBridge::delegate",
        fields(session.id = %parent.session_id, tool.id = %parent.call_id, nested.agent = %self.agent.name())
    )]
    pub async fn delegate<D: Send + Sync + 'static>(
        &self,
        parent: &ToolContext<D>,
        prompt: impl Into<String>,
        deps: Arc<N>,
    ) -> ToolResult {
        let agent = self.agent.name().to_string();
        let mut session =
            match self
                .agent
                .start_with_token(prompt, deps, parent.cancellation_token.child_token())
            {
                Ok(session) => session,
                Err(error) => {
                    warn!(error = %error, "Nested session could not start");
                    return ToolError::Delegation {
                        agent,
                        message: error.to_string(),
                    }
                    .into();
                }
            };

        // A parent timeout or cancellation drops this future mid-run; the
        // guard then merges on drop.
        let merge = NestedUsageMerge::new(parent.usage().clone(), session.usage_handle());
        let outcome = session.run_to_end().await;
        let nested_usage = merge.complete();
        info!(
            nested.session = %session.id(),
            nested.total_units = nested_usage.total_units(),
            succeeded = outcome.is_ok(),
            "Nested session finished"
        );

        match outcome {
            Ok(output) => ToolResult::Agent(AgentResult {
                agent,
                session_id: session.id().to_string(),
                content: output.text,
                structured: output.data,
            }),
            Err(error) => ToolError::Delegation {
                agent,
                message: error.to_string(),
            }
            .into(),
        }
    }
}

/// Folds a nested session's counters into the parent exactly once.
///
/// Completed explicitly on the normal path; otherwise on drop.
struct NestedUsageMerge {
    parent: UsageAccumulator,
    nested: UsageAccumulator,
    merged: bool,
}

impl NestedUsageMerge {
    fn new(parent: UsageAccumulator, nested: UsageAccumulator) -> Self {
        Self {
            parent,
            nested,
            merged: false,
        }
    }

    fn complete(mut self) -> UsageCounters {
        self.merge_once()
    }

    fn merge_once(&mut self) -> UsageCounters {
        let nested = self.nested.snapshot();
        if !self.merged {
            self.parent.merge(&nested);
            self.merged = true;
        }
        nested
    }
}

impl Drop for NestedUsageMerge {
    fn drop(&mut self) {
        if !self.merged {
            let nested = self.merge_once();
            debug!(
                nested.total_units = nested.total_units(),
                "Nested session interrupted, usage merged"
            );
        }
    }
}

/// Tool handler that turns typed arguments into a delegation.
///
/// `map` builds the nested prompt and the nested dependency bundle from the
/// call's parameters and the parent's context.
pub struct DelegateTool<N, P, F> {
    bridge: DelegationBridge<N>,
    schema: ToolSchema,
    map: F,
    _params: PhantomData<fn() -> P>,
}

impl<N, P, F> DelegateTool<N, P, F>
where
    N: DependencyBundle,
    P: JsonSchema,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        bridge: DelegationBridge<N>,
        map: F,
    ) -> Self {
        Self {
            bridge,
            schema: ToolSchema {
                name: name.into(),
                description: description.into(),
                input_schema: schema_for::<P>(),
            },
            map,
            _params: PhantomData,
        }
    }

    pub fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }
}

#[async_trait]
impl<D, N, P, F> ToolHandler<D> for DelegateTool<N, P, F>
where
    D: Send + Sync + 'static,
    N: DependencyBundle,
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, &ToolContext<D>) -> Result<(String, Arc<N>), ToolError> + Send + Sync + 'static,
{
    async fn invoke(&self, args: Value, ctx: ToolContext<D>) -> Result<ToolResult, ToolError> {
        let params: P = serde_json::from_value(args).map_err(|e| {
            ToolError::execution(&self.schema.name, format!("invalid parameters: {e}"))
        })?;
        let (prompt, deps) = (self.map)(params, &ctx)?;
        Ok(self.bridge.delegate(&ctx, prompt, deps).await)
    }
}
