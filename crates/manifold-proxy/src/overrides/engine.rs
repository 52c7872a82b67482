//! The override engine: rule compilation and application.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use manifold_core::{Tool, ToolAnnotations};

use crate::overrides::merge::{deep_merge, replace_schema, shallow_merge_schema};
use crate::overrides::pattern::Pattern;

/// One override rule's payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverride {
    /// Replace the exposed tool name (enables renaming)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Replace the description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Annotations merged under `_meta.annotations`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
    /// Input-schema rewrite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema_override: Option<SchemaOverride>,
}

/// Schema rewrite payload and strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaOverride {
    /// How the payload combines with the original schema
    pub strategy: MergeStrategy,
    /// Property entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
    /// Per-property patches, applied on top of `properties`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_overrides: Option<Map<String, Value>>,
    /// Required-parameter list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

/// Merge strategy for a schema override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Substitute the provided properties/required wholesale
    #[serde(rename = "replace")]
    Replace,
    /// Shallow top-level property merge
    #[serde(rename = "merge")]
    Merge,
    /// Recursive merge with cycle guard
    #[serde(rename = "deep-merge")]
    DeepMerge,
}

impl SchemaOverride {
    /// The combined property payload: `properties` with
    /// `property_overrides` layered on top.
    #[must_use]
    pub fn effective_properties(&self) -> Option<Map<String, Value>> {
        match (&self.properties, &self.property_overrides) {
            (None, None) => None,
            (Some(properties), None) => Some(properties.clone()),
            (None, Some(overrides)) => Some(overrides.clone()),
            (Some(properties), Some(overrides)) => {
                let mut combined = properties.clone();
                for (key, value) in overrides {
                    let merged = match combined.get(key) {
                        Some(existing) => deep_merge(existing, value),
                        None => value.clone(),
                    };
                    combined.insert(key.clone(), merged);
                }
                Some(combined)
            }
        }
    }
}

struct CompiledRule {
    pattern: Pattern,
    payload: ToolOverride,
}

/// Compiled, specificity-ordered override rules.
///
/// Engines are immutable; the dynamic facade swaps in a freshly built
/// engine on every mutation, so readers always see a consistent rule set.
pub struct OverrideEngine {
    rules: Vec<CompiledRule>,
}

impl std::fmt::Debug for OverrideEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let patterns: Vec<&str> = self.rules.iter().map(|r| r.pattern.raw()).collect();
        f.debug_struct("OverrideEngine").field("rules", &patterns).finish()
    }
}

impl OverrideEngine {
    /// Compile a rule table, ordering by specificity and warning on any
    /// pair of patterns that can match the same name.
    #[must_use]
    pub fn new(table: &HashMap<String, ToolOverride>) -> Self {
        let mut rules: Vec<CompiledRule> = table
            .iter()
            .map(|(raw, payload)| CompiledRule {
                pattern: Pattern::compile(raw),
                payload: payload.clone(),
            })
            .collect();
        rules.sort_by(|a, b| a.pattern.specificity_cmp(&b.pattern));

        for (i, left) in rules.iter().enumerate() {
            for right in &rules[i + 1..] {
                if left.pattern.may_conflict(&right.pattern) {
                    warn!(
                        "Patterns '{}' and '{}' may conflict",
                        left.pattern.raw(),
                        right.pattern.raw()
                    );
                }
            }
        }

        Self { rules }
    }

    /// An engine with no rules.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Whether any rules are compiled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The first rule matching `name`, by specificity.
    #[must_use]
    pub fn rule_for(&self, name: &str) -> Option<&ToolOverride> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(name))
            .map(|rule| &rule.payload)
    }

    /// Apply the first matching rule to a tool exposed under
    /// `namespaced_name`, returning the rewritten descriptor. Without a
    /// match the tool passes through with only its name namespaced.
    #[must_use]
    pub fn apply(&self, tool: &Tool, namespaced_name: &str) -> Tool {
        let mut exposed = tool.clone();
        exposed.name = namespaced_name.to_string();

        let Some(rule) = self.rule_for(namespaced_name) else {
            return exposed;
        };

        if let Some(name) = &rule.name {
            exposed.name = name.clone();
        }
        if let Some(description) = &rule.description {
            exposed.description = Some(description.clone());
        }
        if let Some(annotations) = &rule.annotations {
            let meta = exposed.meta.get_or_insert_with(Map::new);
            let slot = meta
                .entry("annotations")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(existing) = slot {
                let mut merged = ToolAnnotations(existing.clone());
                merged.merge(annotations);
                *slot = Value::Object(merged.0);
            }
        }
        if let Some(schema) = &rule.input_schema_override {
            let properties = schema.effective_properties();
            exposed.input_schema = match schema.strategy {
                MergeStrategy::Replace => replace_schema(
                    &exposed.input_schema,
                    properties.as_ref(),
                    schema.required.as_deref(),
                ),
                MergeStrategy::Merge => shallow_merge_schema(
                    &exposed.input_schema,
                    properties.as_ref(),
                    schema.required.as_deref(),
                ),
                MergeStrategy::DeepMerge => {
                    let mut patch = Map::new();
                    if let Some(properties) = properties {
                        patch.insert("properties".to_string(), Value::Object(properties));
                    }
                    if let Some(required) = &schema.required {
                        patch.insert("required".to_string(), serde_json::json!(required));
                    }
                    deep_merge(&exposed.input_schema, &Value::Object(patch))
                }
            };
        }

        exposed
    }
}
