//! Core error types.

use thiserror::Error;

/// A specialized `Result` type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the foundation layer.
///
/// Everything here is fatal at configuration time: the caller is expected to
/// abort construction rather than retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// An environment reference named a variable that is not set and carried
    /// no default.
    #[error("Unresolved environment variable: {0}")]
    UnresolvedEnvVar(String),

    /// Environment references form a cycle (a variable's value refers back to
    /// itself through any number of hops).
    #[error("Environment reference cycle: {0}")]
    EnvReferenceCycle(String),

    /// Environment references nest deeper than the resolver allows.
    #[error("Environment reference nesting exceeds {0} levels")]
    EnvReferenceDepth(usize),

    /// An environment reference was malformed (e.g. `${` without a closing
    /// brace, or an empty variable name).
    #[error("Malformed environment reference: {0}")]
    MalformedEnvRef(String),
}
