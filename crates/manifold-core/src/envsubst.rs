//! Environment reference expansion for configuration strings.
//!
//! Config values may embed `${NAME}` or `${NAME:default}` references. A
//! variable's value may itself contain references, so expansion recurses with
//! a depth bound and an active-name stack that turns reference cycles into
//! configuration errors instead of stack overflows.

use std::collections::HashSet;

use crate::error::{CoreError, CoreResult};

/// Maximum nesting of references through variable values.
pub const MAX_REF_DEPTH: usize = 10;

/// Expand every environment reference in `input` against the process
/// environment.
///
/// # Errors
///
/// Fails on an unset variable without a default, a malformed reference, a
/// reference cycle, or nesting deeper than [`MAX_REF_DEPTH`].
pub fn expand(input: &str) -> CoreResult<String> {
    expand_with(input, &|name| std::env::var(name).ok())
}

/// Expand with a caller-supplied variable lookup. The seam the tests use.
pub fn expand_with(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> CoreResult<String> {
    let mut active = Vec::new();
    expand_inner(input, lookup, &mut active, 0)
}

fn expand_inner(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    active: &mut Vec<String>,
    depth: usize,
) -> CoreResult<String> {
    if depth > MAX_REF_DEPTH {
        return Err(CoreError::EnvReferenceDepth(MAX_REF_DEPTH));
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(CoreError::MalformedEnvRef(truncate_for_error(rest)));
        };

        let body = &after[..end];
        let (name, default) = match body.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (body, None),
        };

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CoreError::MalformedEnvRef(truncate_for_error(body)));
        }

        if active.iter().any(|seen| seen == name) {
            let mut chain = active.join(" -> ");
            chain.push_str(" -> ");
            chain.push_str(name);
            return Err(CoreError::EnvReferenceCycle(chain));
        }

        let raw = match lookup(name) {
            Some(value) => value,
            None => match default {
                Some(default) => default.to_string(),
                None => return Err(CoreError::UnresolvedEnvVar(name.to_string())),
            },
        };

        active.push(name.to_string());
        let expanded = expand_inner(&raw, lookup, active, depth + 1)?;
        active.pop();

        out.push_str(&expanded);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn truncate_for_error(s: &str) -> String {
    const LIMIT: usize = 48;
    if s.len() <= LIMIT {
        s.to_string()
    } else {
        let cut = s.char_indices().take_while(|(i, _)| *i < LIMIT).count();
        format!("{}...", &s[..cut])
    }
}

/// Whether a string contains at least one unexpanded reference. Used by the
/// config pipeline to skip the resolver for literal values.
#[must_use]
pub fn has_refs(input: &str) -> bool {
    input.contains("${")
}

/// Collect the variable names referenced by a string (non-recursive).
///
/// The no-leakage check in the proxy logger uses this to know which
/// environment values must never appear in emitted log lines.
#[must_use]
pub fn referenced_names(input: &str) -> HashSet<String> {
    let mut names = HashSet::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else { break };
        let body = &after[..end];
        let name = body.split_once(':').map_or(body, |(n, _)| n);
        if !name.is_empty() {
            names.insert(name.to_string());
        }
        rest = &after[end + 1..];
    }
    names
}
