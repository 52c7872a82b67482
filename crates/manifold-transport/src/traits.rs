//! The transport contract.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::TransportResult;
use crate::events::TransportEvent;

/// The kind of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Child process over stdin/stdout
    Stdio,
    /// HTTP POST with a Server-Sent Events return channel
    HttpSse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::HttpSse => write!(f, "http+sse"),
        }
    }
}

/// A client transport to one downstream MCP server.
///
/// Lifecycle and uncorrelated traffic surface on the event stream returned
/// by [`Transport::subscribe`]; correlated request/response traffic goes
/// through [`Transport::request`].
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// The kind of this transport.
    fn kind(&self) -> TransportKind;

    /// A human-readable, already-redacted endpoint description.
    fn endpoint(&self) -> String;

    /// Open the connection (spawn the child, open the SSE stream).
    async fn start(&self) -> TransportResult<()>;

    /// Write a message without awaiting a response (notifications).
    async fn send(&self, message: Value) -> TransportResult<()>;

    /// Send a request and await its correlated response.
    ///
    /// A missing `id` member is filled in with a generated correlation id
    /// before the message is written. `timeout` falls back to the
    /// transport's configured default.
    async fn request(&self, message: Value, timeout: Option<Duration>) -> TransportResult<Value>;

    /// Close the connection and fail all in-flight requests.
    async fn close(&self) -> TransportResult<()>;

    /// Subscribe to the transport's event stream.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Source of authorization headers for outgoing HTTP traffic.
///
/// Auth providers implement this so a transport can attach credentials
/// without depending on the auth crate.
#[async_trait]
pub trait AuthHeaders: Send + Sync + fmt::Debug {
    /// Headers to attach to the next outgoing request, typically
    /// `Authorization: Bearer <token>`.
    async fn auth_headers(&self) -> TransportResult<HashMap<String, String>>;
}
