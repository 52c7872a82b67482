//! Override safety validation.
//!
//! Compares a tool before and after an override is applied. Type changes
//! are errors; requiredness changes are warnings. Errors block a dynamic
//! mutation, warnings only log.

use serde_json::Value;

use manifold_core::Tool;

/// Outcome of validating one override against one tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Blocking problems
    pub errors: Vec<String>,
    /// Logged, non-blocking problems
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Whether the override may be applied.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

fn property_type(tool: &Tool, name: &str) -> Option<String> {
    tool.properties()?
        .get(name)?
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Validate an overridden tool against its original.
///
/// `dynamic` marks a runtime mutation, which additionally warns when a new
/// required parameter appears (static config is allowed to demand more).
#[must_use]
pub fn validate_override(original: &Tool, overridden: &Tool, dynamic: bool) -> ValidationReport {
    let mut report = ValidationReport::default();

    if let Some(properties) = original.properties() {
        for name in properties.keys() {
            let before = property_type(original, name);
            let after = property_type(overridden, name);
            if let (Some(before), Some(after)) = (before, after)
                && before != after
            {
                report.errors.push(format!(
                    "property '{name}' changed type from '{before}' to '{after}'"
                ));
            }
        }
    }

    let before_required = original.required();
    let after_required = overridden.required();
    for name in &before_required {
        if !after_required.contains(name) {
            report
                .warnings
                .push(format!("formerly required parameter '{name}' was removed"));
        }
    }
    if dynamic {
        for name in &after_required {
            if !before_required.contains(name) {
                report
                    .warnings
                    .push(format!("new required parameter '{name}' was added"));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn original() -> Tool {
        Tool::new("search").with_schema(json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "number"}
            },
            "required": ["query"]
        }))
    }

    #[test]
    fn test_unchanged_tool_is_valid() {
        let report = validate_override(&original(), &original(), true);
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_type_change_is_error() {
        let changed = original().with_schema(json!({
            "type": "object",
            "properties": {
                "query": {"type": "number"},
                "limit": {"type": "number"}
            },
            "required": ["query"]
        }));
        let report = validate_override(&original(), &changed, false);
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("'query'"));
    }

    #[test]
    fn test_removed_required_is_warning() {
        let changed = original().with_schema(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}, "limit": {"type": "number"}},
            "required": []
        }));
        let report = validate_override(&original(), &changed, false);
        assert!(report.is_valid());
        assert!(report.warnings[0].contains("formerly required"));
    }

    #[test]
    fn test_added_required_warns_only_for_dynamic() {
        let changed = original().with_schema(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}, "limit": {"type": "number"}},
            "required": ["query", "limit"]
        }));
        let dynamic = validate_override(&original(), &changed, true);
        assert_eq!(dynamic.warnings.len(), 1);

        let static_config = validate_override(&original(), &changed, false);
        assert!(static_config.warnings.is_empty());
    }

    #[test]
    fn test_property_dropped_entirely_is_not_type_error() {
        let changed = original().with_schema(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }));
        let report = validate_override(&original(), &changed, false);
        assert!(report.is_valid());
    }
}
