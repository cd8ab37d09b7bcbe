use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::handler::{Tool, ToolHandler, TypedHandler};
use fathom_tools::{ArgumentValidator, ExecutionMode, SchemaError, ToolSchema};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool '{name}' is already registered")]
    DuplicateTool { name: String },

    #[error("Tool '{name}' has an invalid argument schema: {source}")]
    InvalidSchema {
        name: String,
        #[source]
        source: SchemaError,
    },
}

/// One registered tool: its declaration, compiled validator, handler and
/// scheduling mode.
pub struct ToolRegistration<D> {
    pub schema: ToolSchema,
    pub mode: ExecutionMode,
    pub(crate) validator: ArgumentValidator,
    pub(crate) handler: Arc<dyn ToolHandler<D>>,
}

impl<D> fmt::Debug for ToolRegistration<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistration")
            .field("name", &self.schema.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Tools available to one agent, keyed by name. Built before any session
/// starts and read-only afterwards.
pub struct ToolRegistry<D> {
    tools: BTreeMap<String, ToolRegistration<D>>,
}

impl<D> Default for ToolRegistry<D> {
    fn default() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }
}

impl<D> fmt::Debug for ToolRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

impl<D: Send + Sync + 'static> ToolRegistry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `schema.name`.
    ///
    /// Fails if the name is taken or the argument schema does not compile.
    pub fn register(
        &mut self,
        schema: ToolSchema,
        handler: impl ToolHandler<D>,
        mode: ExecutionMode,
    ) -> Result<(), RegistryError> {
        self.register_arc(schema, Arc::new(handler), mode)
    }

    pub fn register_arc(
        &mut self,
        schema: ToolSchema,
        handler: Arc<dyn ToolHandler<D>>,
        mode: ExecutionMode,
    ) -> Result<(), RegistryError> {
        if self.tools.contains_key(&schema.name) {
            return Err(RegistryError::DuplicateTool { name: schema.name });
        }

        let validator = ArgumentValidator::compile(&schema.input_schema).map_err(|source| {
            RegistryError::InvalidSchema {
                name: schema.name.clone(),
                source,
            }
        })?;

        self.tools.insert(
            schema.name.clone(),
            ToolRegistration {
                schema,
                mode,
                validator,
                handler,
            },
        );
        Ok(())
    }

    pub fn register_tool<T: Tool<D>>(&mut self, tool: T) -> Result<(), RegistryError> {
        self.register(T::schema(), TypedHandler(tool), T::MODE)
    }

    pub fn get(&self, name: &str) -> Option<&ToolRegistration<D>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Declarations sent to the model, ordered by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema.clone()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
