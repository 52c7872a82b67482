//! Tool catalog overrides.
//!
//! Rules keyed by exact names or `*` globs rewrite the exposed catalog:
//! renames, description and annotation replacement, and schema merges. The
//! engine is compiled once per rule-set change; the dynamic facade layers
//! runtime mutations on top of the static table.

mod dynamic;
mod engine;
mod merge;
mod pattern;
mod validate;

pub use dynamic::{ChangeHook, DynamicOverrides, OverrideSettings};
pub use engine::{MergeStrategy, OverrideEngine, SchemaOverride, ToolOverride};
pub use merge::{deep_merge, replace_schema, shallow_merge_schema};
pub use pattern::Pattern;
pub use validate::{ValidationReport, validate_override};
