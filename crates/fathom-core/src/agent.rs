use std::fmt;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::api::Provider;
use crate::config::RunConfig;
use crate::conversation::Message;
use crate::deps::DependencyBundle;
use crate::error::{ConfigurationError, RunError};
use crate::node::FinalOutput;
use crate::session::RunSession;
use crate::tools::handler::{Tool, ToolHandler, schema_for};
use crate::tools::registry::ToolRegistry;
use crate::usage::UsageCounters;
use fathom_tools::{ArgumentValidator, ExecutionMode, InputSchema, ToolSchema};

/// Schema the final answer must satisfy.
pub(crate) struct OutputSpec {
    pub(crate) schema: InputSchema,
    pub(crate) validator: ArgumentValidator,
}

/// System prompt part computed from a session's dependency bundle.
type DynamicPrompt<D> = Box<dyn Fn(&D) -> Option<String> + Send + Sync>;

pub(crate) struct AgentInner<D> {
    pub(crate) name: String,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) system_prompt: Option<String>,
    pub(crate) dynamic_prompts: Vec<DynamicPrompt<D>>,
    pub(crate) registry: Arc<ToolRegistry<D>>,
    pub(crate) config: RunConfig,
    pub(crate) output: Option<OutputSpec>,
}

/// A configured agent: model backend, instructions, tools and limits.
///
/// Cheap to clone. Every call to [`Agent::start`] creates an independent
/// [`RunSession`].
pub struct Agent<D> {
    pub(crate) inner: Arc<AgentInner<D>>,
}

impl<D> Clone for Agent<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> fmt::Debug for Agent<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.inner.name)
            .field("provider", &self.inner.provider.name())
            .field("tools", &self.inner.registry)
            .field("dynamic_prompts", &self.inner.dynamic_prompts.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of [`Agent::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub session_id: String,
    pub output: FinalOutput,
    pub usage: UsageCounters,
    pub history: Vec<Message>,
}

impl<D: DependencyBundle> Agent<D> {
    pub fn builder(name: impl Into<String>, provider: Arc<dyn Provider>) -> AgentBuilder<D> {
        AgentBuilder::new(name, provider)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &RunConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ToolRegistry<D> {
        &self.inner.registry
    }

    /// Start a session. Nothing runs until the first `advance`.
    pub fn start(&self, prompt: impl Into<String>, deps: Arc<D>) -> Result<RunSession<D>, RunError> {
        self.start_with_token(prompt, deps, CancellationToken::new())
    }

    pub(crate) fn start_with_token(
        &self,
        prompt: impl Into<String>,
        deps: Arc<D>,
        token: CancellationToken,
    ) -> Result<RunSession<D>, RunError> {
        deps.validate()?;
        Ok(RunSession::new(self.clone(), prompt.into(), deps, token))
    }

    /// Drive a fresh session to its end node.
    #[instrument(skip_all, name = "Agent::run", fields(agent = %self.inner.name))]
    pub async fn run(&self, prompt: impl Into<String>, deps: Arc<D>) -> Result<RunResult, RunError> {
        let mut session = self.start(prompt, deps)?;
        let output = session.run_to_end().await?;
        Ok(RunResult {
            session_id: session.id().to_string(),
            output,
            usage: session.usage(),
            history: session.into_history(),
        })
    }

    /// System prompt sent with every request: the static prompt, then each
    /// non-empty dynamic part in registration order, then output instructions.
    pub(crate) fn request_system_prompt(&self, deps: &D) -> Option<String> {
        let output = self.inner.output.as_ref().map(|spec| {
            format!(
                "Respond with only a JSON value matching this schema:\n{}",
                spec.schema.to_json_schema()
            )
        });
        let parts: Vec<String> = self
            .inner
            .system_prompt
            .iter()
            .cloned()
            .chain(
                self.inner
                    .dynamic_prompts
                    .iter()
                    .filter_map(|prompt| prompt(deps))
                    .filter(|part| !part.trim().is_empty()),
            )
            .chain(output)
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }
}

/// Builds an [`Agent`]. Registration errors are reported by [`build`].
///
/// [`build`]: AgentBuilder::build
pub struct AgentBuilder<D> {
    name: String,
    provider: Arc<dyn Provider>,
    system_prompt: Option<String>,
    dynamic_prompts: Vec<DynamicPrompt<D>>,
    registry: ToolRegistry<D>,
    config: RunConfig,
    output: Option<InputSchema>,
    error: Option<ConfigurationError>,
}

impl<D: DependencyBundle> AgentBuilder<D> {
    pub fn new(name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        Self {
            name: name.into(),
            provider,
            system_prompt: None,
            dynamic_prompts: Vec::new(),
            registry: ToolRegistry::new(),
            config: RunConfig::default(),
            output: None,
            error: None,
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Add a system prompt part built from the session's dependencies.
    ///
    /// Evaluated for every model request; returning `None` (or blank text)
    /// adds nothing.
    pub fn dynamic_system_prompt<F>(mut self, prompt: F) -> Self
    where
        F: Fn(&D) -> Option<String> + Send + Sync + 'static,
    {
        self.dynamic_prompts.push(Box::new(prompt));
        self
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tool<T: Tool<D>>(mut self, tool: T) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.registry.register_tool(tool) {
                self.error = Some(e.into());
            }
        }
        self
    }

    pub fn register(
        mut self,
        schema: ToolSchema,
        handler: impl ToolHandler<D>,
        mode: ExecutionMode,
    ) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.registry.register(schema, handler, mode) {
                self.error = Some(e.into());
            }
        }
        self
    }

    /// Require the final answer to be JSON matching `T`'s schema.
    pub fn output_schema<T: JsonSchema>(self) -> Self {
        self.output_json_schema(schema_for::<T>())
    }

    pub fn output_json_schema(mut self, schema: InputSchema) -> Self {
        self.output = Some(schema);
        self
    }

    pub fn build(self) -> Result<Agent<D>, ConfigurationError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.config.validate()?;

        let output = self
            .output
            .map(|schema| {
                ArgumentValidator::compile(&schema)
                    .map(|validator| OutputSpec { schema, validator })
                    .map_err(ConfigurationError::OutputSchema)
            })
            .transpose()?;

        debug!(
            agent = %self.name,
            tools = ?self.registry.names(),
            structured_output = output.is_some(),
            "Agent built"
        );

        Ok(Agent {
            inner: Arc::new(AgentInner {
                name: self.name,
                provider: self.provider,
                system_prompt: self.system_prompt,
                dynamic_prompts: self.dynamic_prompts,
                registry: Arc::new(self.registry),
                config: self.config,
                output,
            }),
        })
    }
}
