//! Runtime override mutation.
//!
//! The facade layers dynamic overrides over the static configuration
//! table. Every successful mutation rebuilds the engine from the merged
//! table and swaps it in atomically, then fires the change hook so the
//! proxy can drop caches and tell the upstream the tool list changed.
//! Readers never lock: they load the current engine snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use manifold_core::Tool;

use crate::error::{ProxyError, ProxyResult};
use crate::overrides::engine::{OverrideEngine, ToolOverride};
use crate::overrides::validate::validate_override;

/// Behavior switches for dynamic overrides.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideSettings {
    /// Whether runtime mutations are applied at all
    #[serde(default)]
    pub apply_to_dynamic: bool,
    /// Whether mutations are validated before applying
    #[serde(default)]
    pub validate_overrides: bool,
}

/// Hook invoked after every successful mutation.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

/// Dynamic override facade over the engine.
pub struct DynamicOverrides {
    settings: OverrideSettings,
    /// Static rules from configuration; never mutated at runtime
    base: HashMap<String, ToolOverride>,
    /// Runtime layer; wins over `base` per pattern
    dynamic: StdMutex<HashMap<String, ToolOverride>>,
    engine: ArcSwap<OverrideEngine>,
    change_hook: StdMutex<Option<ChangeHook>>,
}

impl std::fmt::Debug for DynamicOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicOverrides")
            .field("settings", &self.settings)
            .field("base_rules", &self.base.len())
            .finish_non_exhaustive()
    }
}

impl DynamicOverrides {
    /// Create the facade over a static rule table.
    #[must_use]
    pub fn new(base: HashMap<String, ToolOverride>, settings: OverrideSettings) -> Self {
        let engine = OverrideEngine::new(&base);
        Self {
            settings,
            base,
            dynamic: StdMutex::new(HashMap::new()),
            engine: ArcSwap::from_pointee(engine),
            change_hook: StdMutex::new(None),
        }
    }

    /// Register the hook fired after every successful mutation.
    pub fn set_change_hook(&self, hook: ChangeHook) {
        *self.change_hook.lock().expect("hook mutex poisoned") = Some(hook);
    }

    /// The current engine snapshot.
    #[must_use]
    pub fn engine(&self) -> Arc<OverrideEngine> {
        self.engine.load_full()
    }

    /// The merged rule table (static base plus dynamic layer).
    #[must_use]
    pub fn current(&self) -> HashMap<String, ToolOverride> {
        let mut merged = self.base.clone();
        for (pattern, payload) in self.dynamic.lock().expect("dynamic mutex poisoned").iter() {
            merged.insert(pattern.clone(), payload.clone());
        }
        merged
    }

    /// Add or replace one dynamic rule. Rejected outright when validation
    /// is enabled and the rule fails it.
    pub fn set(&self, pattern: &str, payload: ToolOverride) -> ProxyResult<()> {
        if let Err(e) = self.check(pattern, &payload) {
            return Err(e);
        }
        self.dynamic
            .lock()
            .expect("dynamic mutex poisoned")
            .insert(pattern.to_string(), payload);
        self.rebuild();
        Ok(())
    }

    /// Apply a batch of rules. Invalid entries are skipped with an error
    /// log; the valid remainder is applied.
    pub fn update(&self, batch: HashMap<String, ToolOverride>) -> ProxyResult<()> {
        {
            let mut dynamic = self.dynamic.lock().expect("dynamic mutex poisoned");
            for (pattern, payload) in batch {
                match self.check(&pattern, &payload) {
                    Ok(()) => {
                        dynamic.insert(pattern, payload);
                    }
                    Err(e) => error!("skipping invalid override '{pattern}': {e}"),
                }
            }
        }
        self.rebuild();
        Ok(())
    }

    /// Remove one dynamic rule. Removing an unknown pattern is a no-op.
    pub fn remove(&self, pattern: &str) {
        let removed = self
            .dynamic
            .lock()
            .expect("dynamic mutex poisoned")
            .remove(pattern)
            .is_some();
        if removed {
            self.rebuild();
        }
    }

    /// Drop the entire dynamic layer, restoring the static table.
    pub fn clear(&self) {
        let had_rules = {
            let mut dynamic = self.dynamic.lock().expect("dynamic mutex poisoned");
            let had_rules = !dynamic.is_empty();
            dynamic.clear();
            had_rules
        };
        if had_rules {
            self.rebuild();
        }
    }

    fn rebuild(&self) {
        let merged = self.current();
        self.engine.store(Arc::new(OverrideEngine::new(&merged)));
        let hook = self.change_hook.lock().expect("hook mutex poisoned").clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Validate one rule against a synthetic minimal tool when validation
    /// is enabled. Warnings log; errors reject.
    fn check(&self, pattern: &str, payload: &ToolOverride) -> ProxyResult<()> {
        if !(self.settings.apply_to_dynamic && self.settings.validate_overrides) {
            return Ok(());
        }

        let synthetic = Tool::new("synthetic").with_schema(json!({
            "type": "object",
            "properties": {"input": {"type": "string"}},
            "required": ["input"]
        }));

        let mut single = HashMap::new();
        single.insert(pattern.to_string(), payload.clone());
        let probe = OverrideEngine::new(&single);
        // the probe must match its own pattern to exercise the payload
        let overridden = probe.apply(&synthetic, pattern);

        let report = validate_override(&synthetic, &overridden, true);
        for warning in &report.warnings {
            warn!("override '{pattern}': {warning}");
        }
        if let Some(first_error) = report.errors.first() {
            return Err(ProxyError::InvalidOverride {
                name: pattern.to_string(),
                reason: first_error.clone(),
            });
        }
        Ok(())
    }
}
