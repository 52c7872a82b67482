//! Proxy error types.

use thiserror::Error;

use manifold_transport::TransportError;

/// A specialized `Result` type for proxy operations.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Errors surfaced by the proxy core and connection managers.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ProxyError {
    /// No exposed tool carries this name.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The tool's server is currently not connected; the call fails fast
    /// instead of waiting for a reconnect.
    #[error("server not connected: {0}")]
    ServerNotConnected(String),

    /// No server with this name is configured.
    #[error("unknown server: {0}")]
    UnknownServer(String),

    /// A lifecycle operation is not valid in the current connection state
    /// (e.g. reconnecting a connected server).
    #[error("invalid operation on '{server}': {reason}")]
    InvalidOperation {
        /// Server the operation targeted
        server: String,
        /// Why the operation is not allowed right now
        reason: String,
    },

    /// A dynamic override was rejected by validation.
    #[error("invalid override '{name}': {reason}")]
    InvalidOverride {
        /// The override's pattern key
        name: String,
        /// First validation error
        reason: String,
    },

    /// Invalid configuration. Fatal at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// A transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<manifold_core::CoreError> for ProxyError {
    fn from(err: manifold_core::CoreError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<manifold_auth::AuthError> for ProxyError {
    fn from(err: manifold_auth::AuthError) -> Self {
        Self::Config(err.to_string())
    }
}
