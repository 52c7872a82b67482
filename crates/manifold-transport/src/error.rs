//! Transport error types.

use thiserror::Error;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while talking to one downstream server.
///
/// The variants map onto the proxy's failure taxonomy: connection errors are
/// recoverable and feed the reconnection policy, timeouts and JSON-RPC
/// errors surface to the specific call that triggered them, configuration
/// errors are fatal at construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish a connection (spawn failure, TCP/TLS failure,
    /// SSE handshake rejection).
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost. Pending requests affected by the
    /// loss fail with this variant, distinct from [`Self::RequestTimeout`].
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The transport is not currently connected.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Failed to write a message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The per-request deadline fired before a correlated response arrived.
    #[error("Request timeout after {0}ms")]
    RequestTimeout(u64),

    /// The downstream answered a request with a JSON-RPC error object.
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// JSON-RPC error code
        code: i64,
        /// JSON-RPC error message
        message: String,
    },

    /// Failed to serialize or deserialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A protocol-level violation (embedded newline, oversized frame,
    /// non-object message).
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The transport was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Fetching authorization headers for an outgoing request failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl From<manifold_core::JsonRpcError> for TransportError {
    fn from(err: manifold_core::JsonRpcError) -> Self {
        Self::JsonRpc {
            code: err.code,
            message: err.message,
        }
    }
}
