use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

/// JSON-schema description of a tool's arguments, as declared to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSchema {
    pub properties: serde_json::Map<String, Value>,
    pub required: Vec<String>,
    #[serde(rename = "type")]
    pub schema_type: String,
}

impl InputSchema {
    /// An object schema with the given property map and required keys.
    pub fn object(properties: serde_json::Map<String, Value>, required: Vec<String>) -> Self {
        Self {
            properties,
            required,
            schema_type: "object".to_string(),
        }
    }

    /// An object schema that declares no properties.
    pub fn empty() -> Self {
        Self::object(serde_json::Map::new(), Vec::new())
    }

    /// The schema as a JSON-schema document suitable for validation.
    pub fn to_json_schema(&self) -> Value {
        let mut doc = serde_json::Map::new();
        doc.insert("type".to_string(), Value::String(self.schema_type.clone()));
        doc.insert(
            "properties".to_string(),
            Value::Object(self.properties.clone()),
        );
        if !self.required.is_empty() {
            doc.insert(
                "required".to_string(),
                Value::Array(self.required.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(doc)
    }
}

impl From<schemars::Schema> for InputSchema {
    fn from(schema: schemars::Schema) -> Self {
        let value = serde_json::to_value(&schema).unwrap_or(Value::Null);
        let Some(obj) = value.as_object() else {
            return Self::empty();
        };

        let properties = obj
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let required = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let schema_type = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("object")
            .to_string();

        Self {
            properties,
            required,
            schema_type,
        }
    }
}

/// How the dispatcher schedules a tool relative to its siblings in one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionMode {
    /// Runs to completion before the next pending call starts.
    #[default]
    Blocking,
    /// May run concurrently with sibling calls in the same node.
    NonBlocking,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

/// A model-requested invocation of a named tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub parameters: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    #[expect(dead_code)]
    struct SearchParams {
        /// Search query
        query: String,
        max_results: Option<u32>,
    }

    #[test]
    fn schema_from_schemars_keeps_required_fields() {
        let input: InputSchema = schemars::schema_for!(SearchParams).into();

        assert_eq!(input.schema_type, "object");
        assert!(input.properties.contains_key("query"));
        assert!(input.properties.contains_key("max_results"));
        assert_eq!(input.required, vec!["query".to_string()]);
    }

    #[test]
    fn json_schema_omits_empty_required() {
        let doc = InputSchema::empty().to_json_schema();
        assert_eq!(doc, json!({"type": "object", "properties": {}}));
    }

    #[test]
    fn execution_mode_displays_snake_case() {
        assert_eq!(ExecutionMode::NonBlocking.to_string(), "non_blocking");
        assert_eq!(ExecutionMode::default(), ExecutionMode::Blocking);
    }
}
