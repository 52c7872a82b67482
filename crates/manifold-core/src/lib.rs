//! Core types shared across the Manifold proxy.
//!
//! This crate is the foundation layer: JSON-RPC 2.0 message types, the MCP
//! tool descriptor, request-id generation, secret redaction for logs, and
//! the `${NAME}` / `${NAME:default}` environment reference resolver used by
//! the configuration pipeline.

pub mod envsubst;
pub mod error;
pub mod ids;
pub mod jsonrpc;
pub mod redact;
pub mod tool;

pub use error::{CoreError, CoreResult};
pub use ids::generate_request_id;
pub use jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId,
};
pub use redact::{redact_secrets, redact_url};
pub use tool::{Tool, ToolAnnotations};

/// Separator between a server namespace and the original tool name.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Build the namespaced name a tool is exposed under.
#[must_use]
pub fn namespaced_name(server: &str, tool: &str) -> String {
    format!("{server}{NAMESPACE_SEPARATOR}{tool}")
}

/// Split a namespaced name back into `(server, original_name)`.
///
/// Returns `None` when the name carries no namespace separator.
#[must_use]
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}
