//! Client transports for downstream MCP servers.
//!
//! Two concrete transports share one contract: a newline-delimited JSON-RPC
//! stdio transport that owns a child process, and an HTTP transport that
//! POSTs requests and listens on a Server-Sent Events stream. Both correlate
//! responses to in-flight requests through a pending-request table with
//! per-call deadlines, and both coordinate recovery through the
//! [`ReconnectManager`] backoff scheduler.

pub mod error;
pub mod events;
pub mod http_sse;
pub mod pending;
pub mod reconnect;
pub mod stdio;
pub mod traits;

pub use error::{TransportError, TransportResult};
pub use events::{TransportEvent, TransportEventEmitter};
pub use http_sse::{HttpSseConfig, HttpSseTransport};
pub use pending::PendingRequests;
pub use reconnect::{ReconnectManager, ReconnectPolicy};
pub use stdio::{StdioConfig, StdioTransport};
pub use traits::{AuthHeaders, Transport, TransportKind};
