use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::usage::UsageAccumulator;
use fathom_tools::{ExecutionMode, InputSchema, ToolError, ToolResult, ToolSchema};

/// Everything a handler may touch while serving one call.
pub struct ToolContext<D> {
    pub call_id: String,
    pub session_id: String,
    /// Name of the agent whose session issued the call.
    pub agent: String,
    pub cancellation_token: CancellationToken,
    deps: Arc<D>,
    usage: UsageAccumulator,
}

impl<D> Clone for ToolContext<D> {
    fn clone(&self) -> Self {
        Self {
            call_id: self.call_id.clone(),
            session_id: self.session_id.clone(),
            agent: self.agent.clone(),
            cancellation_token: self.cancellation_token.clone(),
            deps: Arc::clone(&self.deps),
            usage: self.usage.clone(),
        }
    }
}

impl<D> fmt::Debug for ToolContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("call_id", &self.call_id)
            .field("session_id", &self.session_id)
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

impl<D> ToolContext<D> {
    pub fn new(
        session_id: impl Into<String>,
        agent: impl Into<String>,
        deps: Arc<D>,
        usage: UsageAccumulator,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            call_id: String::new(),
            session_id: session_id.into(),
            agent: agent.into(),
            cancellation_token,
            deps,
            usage,
        }
    }

    /// Context for one call, sharing deps and usage with `self`.
    pub(crate) fn for_call(&self, call_id: &str, token: CancellationToken) -> Self {
        Self {
            call_id: call_id.to_string(),
            cancellation_token: token,
            ..self.clone()
        }
    }

    pub fn deps(&self) -> &D {
        &self.deps
    }

    /// The issuing session's counters. Delegation merges nested usage here.
    pub fn usage(&self) -> &UsageAccumulator {
        &self.usage
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// Executes one validated tool call.
///
/// Arguments reach the handler only after they passed the registered schema.
/// Returning `Err` (or panicking) is reported to the model as a tool error;
/// it never ends the session.
#[async_trait]
pub trait ToolHandler<D>: Send + Sync + 'static {
    async fn invoke(&self, args: Value, ctx: ToolContext<D>) -> Result<ToolResult, ToolError>;
}

/// Generate an argument schema for `T` the same way for every tool.
pub fn schema_for<T: JsonSchema>() -> InputSchema {
    let settings = schemars::generate::SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
    });
    let schema_gen = settings.into_generator();
    schema_gen.into_root_schema_for::<T>().into()
}

/// A tool with typed parameters. Register with `ToolRegistry::register_tool`.
#[async_trait]
pub trait Tool<D: Send + Sync + 'static>: Send + Sync + 'static {
    type Params: DeserializeOwned + JsonSchema + Send;
    type Output: Serialize + Send;

    const NAME: &'static str;
    const DESCRIPTION: &'static str;
    const MODE: ExecutionMode = ExecutionMode::Blocking;

    async fn execute(
        &self,
        params: Self::Params,
        ctx: &ToolContext<D>,
    ) -> Result<Self::Output, ToolError>;

    fn schema() -> ToolSchema
    where
        Self: Sized,
    {
        ToolSchema {
            name: Self::NAME.to_string(),
            description: Self::DESCRIPTION.to_string(),
            input_schema: schema_for::<Self::Params>(),
        }
    }
}

/// Erases a [`Tool`]'s parameter and output types.
pub(crate) struct TypedHandler<T>(pub(crate) T);

#[async_trait]
impl<D, T> ToolHandler<D> for TypedHandler<T>
where
    D: Send + Sync + 'static,
    T: Tool<D>,
{
    async fn invoke(&self, args: Value, ctx: ToolContext<D>) -> Result<ToolResult, ToolError> {
        let params: T::Params = serde_json::from_value(args)
            .map_err(|e| ToolError::execution(T::NAME, format!("invalid parameters: {e}")))?;

        if ctx.is_cancelled() {
            return Err(ToolError::Cancelled {
                tool_name: T::NAME.to_string(),
            });
        }

        let output = self.0.execute(params, &ctx).await?;
        let value = serde_json::to_value(output)
            .map_err(|e| ToolError::execution(T::NAME, format!("unserializable output: {e}")))?;
        Ok(ToolResult::Output(value))
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a [`ToolHandler`].
pub fn handler_fn<D, F, Fut>(f: F) -> FnHandler<F, Fut>
where
    D: Send + Sync + 'static,
    F: Fn(Value, ToolContext<D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResult, ToolError>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<D, F, Fut> ToolHandler<D> for FnHandler<F, Fut>
where
    D: Send + Sync + 'static,
    F: Fn(Value, ToolContext<D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResult, ToolError>> + Send + 'static,
{
    async fn invoke(&self, args: Value, ctx: ToolContext<D>) -> Result<ToolResult, ToolError> {
        (self.f)(args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct SearchParams {
        query: String,
        #[serde(default)]
        limit: Option<u32>,
    }

    struct Search;

    #[async_trait]
    impl Tool<()> for Search {
        type Params = SearchParams;
        type Output = Vec<String>;

        const NAME: &'static str = "search";
        const DESCRIPTION: &'static str = "Search the web";

        async fn execute(
            &self,
            params: SearchParams,
            _ctx: &ToolContext<()>,
        ) -> Result<Vec<String>, ToolError> {
            let limit = params.limit.unwrap_or(2) as usize;
            Ok((0..limit).map(|i| format!("{}#{i}", params.query)).collect())
        }
    }

    fn ctx() -> ToolContext<()> {
        ToolContext::new(
            "session",
            "tester",
            Arc::new(()),
            UsageAccumulator::new(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn derived_schema_requires_query() {
        let schema = Search::schema();
        assert_eq!(schema.name, "search");
        assert_eq!(schema.input_schema.required, vec!["query".to_string()]);
        assert!(schema.input_schema.properties.contains_key("limit"));
    }

    #[tokio::test]
    async fn typed_handler_serializes_output() {
        let result = TypedHandler(Search)
            .invoke(json!({"query": "rust", "limit": 1}), ctx())
            .await
            .unwrap();
        assert_eq!(result, ToolResult::Output(json!(["rust#0"])));
    }

    #[tokio::test]
    async fn typed_handler_observes_cancellation() {
        let ctx = ctx();
        ctx.cancellation_token.cancel();
        let err = TypedHandler(Search)
            .invoke(json!({"query": "rust"}), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn closure_handlers_see_call_context() {
        let handler = handler_fn(|_args, ctx: ToolContext<()>| async move {
            Ok(ToolResult::Output(json!(ctx.call_id)))
        });
        let call_ctx = ctx().for_call("call_7", CancellationToken::new());
        let result = handler.invoke(json!({}), call_ctx).await.unwrap();
        assert_eq!(result, ToolResult::Output(json!("call_7")));
    }
}
