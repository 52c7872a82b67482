//! The Manifold proxy core.
//!
//! One upstream MCP surface over N downstream servers: per-server
//! connection lifecycle with automatic reconnection, namespaced tool
//! catalog aggregation with an override engine, and fan-out dispatch with
//! a status event bus.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod overrides;
pub mod proxy;

pub use config::{
    AuthConfig, AutoReconnectConfig, ProxyConfig, ReconnectConfig, ServerConfig, TokenStoreKind,
};
pub use connection::ConnectionManager;
pub use error::{ProxyError, ProxyResult};
pub use events::{ConnectionStatus, EventBus, ProxyEvent, StatusEvent};
pub use overrides::{
    DynamicOverrides, MergeStrategy, OverrideEngine, OverrideSettings, SchemaOverride,
    ToolOverride, validate_override,
};
pub use proxy::{McpProxy, RouteEntry};
