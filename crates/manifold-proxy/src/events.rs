//! Connection status and the proxy event bus.
//!
//! Every connection-state transition is published as a [`StatusEvent`] on a
//! broadcast bus. Subscribers that fall behind drop events; the latest
//! status per server is always available through the connection manager, so
//! the bus is a change feed, not a source of truth.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

const BUS_CAPACITY: usize = 512;

/// The lifecycle state of one downstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection, none being attempted
    Disconnected,
    /// A connection attempt is in progress
    Connecting,
    /// Live connection
    Connected {
        /// When the connection was established
        connected_at: DateTime<Utc>,
    },
    /// Waiting on a backoff timer before the next attempt
    Reconnecting {
        /// 1-based attempt about to run
        attempt: u32,
    },
    /// Connection failed and no retry is scheduled
    Error {
        /// Failure description
        message: String,
    },
    /// Shut down for good
    Terminated,
}

impl ConnectionStatus {
    /// Whether calls may be routed to the server right now.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// One state transition of one server.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// Server name
    pub server: String,
    /// The state entered
    pub status: ConnectionStatus,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
    /// Why, when a reason is known
    pub reason: Option<String>,
    /// Reconnection attempt number, when applicable
    pub attempt: Option<u32>,
}

/// Events published by the proxy.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// A connection changed state
    Status(StatusEvent),
    /// The exposed tool catalog changed; the upstream should re-list
    ToolListChanged,
}

/// Broadcast bus shared by the proxy core and its connection managers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProxyEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to all proxy events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.sender.subscribe()
    }

    /// Publish a status transition.
    pub fn emit_status(
        &self,
        server: &str,
        status: ConnectionStatus,
        reason: Option<String>,
        attempt: Option<u32>,
    ) {
        let event = StatusEvent {
            server: server.to_string(),
            status,
            timestamp: Utc::now(),
            reason,
            attempt,
        };
        trace!(?event, "status event");
        let _ = self.sender.send(ProxyEvent::Status(event));
    }

    /// Publish a tool-list change.
    pub fn emit_tool_list_changed(&self) {
        let _ = self.sender.send(ProxyEvent::ToolListChanged);
    }
}
