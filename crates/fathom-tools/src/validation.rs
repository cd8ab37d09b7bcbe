use std::fmt;
use std::sync::Arc;

use jsonschema::JSONSchema;
use jsonschema::error::{ValidationError, ValidationErrorKind};
use serde_json::Value;

use crate::error::{FieldViolation, SchemaError};
use crate::schema::InputSchema;

const ROOT_FIELD: &str = "$";

/// Compiled argument schema for one registered tool.
///
/// Compilation happens once at registration; every dispatch validates the raw
/// arguments against it and reports all violations, not just the first.
#[derive(Clone)]
pub struct ArgumentValidator {
    compiled: Arc<JSONSchema>,
}

impl ArgumentValidator {
    pub fn compile(schema: &InputSchema) -> Result<Self, SchemaError> {
        let document = schema.to_json_schema();
        let compiled = JSONSchema::compile(&document).map_err(|e| SchemaError {
            details: e.to_string(),
        })?;
        Ok(Self {
            compiled: Arc::new(compiled),
        })
    }

    pub fn validate(&self, args: &Value) -> Result<(), Vec<FieldViolation>> {
        let violations = match self.compiled.validate(args) {
            Ok(()) => return Ok(()),
            Err(errors) => errors.map(|e| violation_from(&e)).collect::<Vec<_>>(),
        };

        let mut unique: Vec<FieldViolation> = Vec::with_capacity(violations.len());
        for violation in violations {
            if !unique.contains(&violation) {
                unique.push(violation);
            }
        }
        Err(unique)
    }
}

impl fmt::Debug for ArgumentValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentValidator").finish_non_exhaustive()
    }
}

fn violation_from(error: &ValidationError<'_>) -> FieldViolation {
    let parent = pointer_to_path(&error.instance_path.to_string());

    // A missing property is reported against its parent object; name the
    // property itself so callers see `query` rather than `$`.
    let field = match &error.kind {
        ValidationErrorKind::Required { property } => {
            let name = property
                .as_str()
                .map_or_else(|| property.to_string(), str::to_string);
            if parent == ROOT_FIELD {
                name
            } else {
                format!("{parent}.{name}")
            }
        }
        _ => parent,
    };

    FieldViolation::new(field, error.to_string())
}

fn pointer_to_path(pointer: &str) -> String {
    let trimmed = pointer.trim_start_matches('/');
    if trimmed.is_empty() {
        ROOT_FIELD.to_string()
    } else {
        trimmed.replace('/', ".")
    }
}
