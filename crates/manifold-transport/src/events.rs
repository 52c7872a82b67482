//! Transport event stream.
//!
//! Each transport publishes its lifecycle and uncorrelated traffic on a
//! broadcast channel. Subscribers that fall behind lose events; current
//! connection state is always reconstructible from the owner, so the stream
//! carries signals, not state.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the broadcast ring buffer behind each emitter.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The underlying connection opened (or re-opened).
    Connected {
        /// Redacted endpoint description
        endpoint: String,
    },
    /// The underlying connection closed.
    Closed {
        /// Close reason, when one is known (e.g. `exit status 1`)
        reason: Option<String>,
    },
    /// A non-correlated inbound message: a notification or a response whose
    /// id matched no pending request.
    Message(Value),
    /// A transport-level error that did not close the connection.
    Error {
        /// Error description (already redacted)
        message: String,
    },
}

/// Emitter half of a transport's event stream.
#[derive(Debug, Clone)]
pub struct TransportEventEmitter {
    sender: broadcast::Sender<TransportEvent>,
}

impl TransportEventEmitter {
    /// Create an emitter together with an initial receiver.
    #[must_use]
    pub fn new() -> (Self, broadcast::Receiver<TransportEvent>) {
        let (sender, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (Self { sender }, receiver)
    }

    /// Subscribe a new receiver to the stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    /// Emit an event; dropped silently when no receiver is attached.
    pub fn emit(&self, event: TransportEvent) {
        trace!(?event, "transport event");
        let _ = self.sender.send(event);
    }

    /// Emit [`TransportEvent::Connected`].
    pub fn emit_connected(&self, endpoint: impl Into<String>) {
        self.emit(TransportEvent::Connected {
            endpoint: endpoint.into(),
        });
    }

    /// Emit [`TransportEvent::Closed`].
    pub fn emit_closed(&self, reason: Option<String>) {
        self.emit(TransportEvent::Closed { reason });
    }

    /// Emit [`TransportEvent::Message`].
    pub fn emit_message(&self, message: Value) {
        self.emit(TransportEvent::Message(message));
    }

    /// Emit [`TransportEvent::Error`].
    pub fn emit_error(&self, message: impl Into<String>) {
        self.emit(TransportEvent::Error {
            message: message.into(),
        });
    }
}
