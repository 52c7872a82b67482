//! MCP tool descriptors.
//!
//! Schemas are kept as raw JSON values restricted by convention to the
//! Draft-2020 subset the proxy understands (`type`, `properties`, `required`,
//! `description`, `enum`, `default`, `items`). Keeping them untyped is what
//! lets the override engine merge arbitrary nesting without a schema model
//! for every provider quirk.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Tool definition as advertised by a downstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name (machine-readable identifier)
    pub name: String,
    /// Tool description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for input parameters
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    /// Behavior hints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
    /// Extension metadata
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl Tool {
    /// Create a tool with an empty object schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: json!({"type": "object", "properties": {}, "required": []}),
            annotations: None,
            meta: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the input schema.
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// The `properties` map of the input schema, when present.
    #[must_use]
    pub fn properties(&self) -> Option<&Map<String, Value>> {
        self.input_schema.get("properties").and_then(Value::as_object)
    }

    /// The `required` list of the input schema, empty when absent.
    #[must_use]
    pub fn required(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Free-form behavior annotations attached to a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolAnnotations(pub Map<String, Value>);

impl ToolAnnotations {
    /// Merge `other` into `self`; keys from `other` win.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tool_wire_shape() {
        let tool = Tool::new("search").with_description("Full-text search").with_schema(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }));
        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(value["inputSchema"]["properties"]["query"]["type"], "string");
        assert!(value.get("_meta").is_none());
    }

    #[test]
    fn test_required_accessor() {
        let tool = Tool::new("t").with_schema(json!({
            "type": "object",
            "properties": {"a": {}, "b": {}},
            "required": ["a"]
        }));
        assert_eq!(tool.required(), vec!["a"]);
    }

    #[test]
    fn test_annotation_merge_overwrites() {
        let mut base = ToolAnnotations(
            json!({"audience": ["user"], "level": "info"}).as_object().unwrap().clone(),
        );
        let patch =
            ToolAnnotations(json!({"level": "debug"}).as_object().unwrap().clone());
        base.merge(&patch);
        assert_eq!(base.0["level"], "debug");
        assert_eq!(base.0["audience"], json!(["user"]));
    }
}
