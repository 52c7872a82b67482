//! Per-server connection management.
//!
//! One manager owns one transport and drives its lifecycle state machine.
//! Reconnection responsibility follows the transport kind: the manager
//! restarts stdio children itself through its [`ReconnectManager`], while
//! the HTTP/SSE transport re-opens its own stream and the manager only
//! mirrors the resulting events into status transitions. Every transition
//! is published on the proxy event bus.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use manifold_transport::{
    ReconnectManager, ReconnectPolicy, Transport, TransportEvent, TransportKind,
};

use crate::error::{ProxyError, ProxyResult};
use crate::events::{ConnectionStatus, EventBus};

struct ConnInner {
    name: String,
    transport: Arc<dyn Transport>,
    reconnect: ReconnectManager,
    auto_reconnect: bool,
    bus: EventBus,
    status: StdMutex<ConnectionStatus>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    default_timeout: Option<Duration>,
}

/// Manages the lifecycle of one downstream connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .field("endpoint", &self.inner.transport.endpoint())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager; the connection is not opened until [`Self::start`].
    #[must_use]
    pub fn new(
        name: &str,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        auto_reconnect: bool,
        bus: EventBus,
        default_timeout: Option<Duration>,
    ) -> Self {
        let inner = Arc::new(ConnInner {
            name: name.to_string(),
            transport,
            reconnect: ReconnectManager::new(policy),
            auto_reconnect,
            bus,
            status: StdMutex::new(ConnectionStatus::Disconnected),
            supervisor: StdMutex::new(None),
            default_timeout,
        });

        let supervisor = Self::spawn_supervisor(&inner);
        *inner.supervisor.lock().expect("supervisor mutex poisoned") = Some(supervisor);

        Self { inner }
    }

    /// The server name this manager owns.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The latest connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.lock().expect("status mutex poisoned").clone()
    }

    fn set_status(&self, status: ConnectionStatus, reason: Option<String>, attempt: Option<u32>) {
        {
            let mut current = self.inner.status.lock().expect("status mutex poisoned");
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        self.inner.bus.emit_status(&self.inner.name, status, reason, attempt);
    }

    /// Open the connection. On failure the status moves to `Error` and,
    /// with auto-reconnect enabled, a retry is scheduled; the error is
    /// still returned so construction-time callers can report it.
    pub async fn start(&self) -> ProxyResult<()> {
        self.connect_attempt().await
    }

    async fn connect_attempt(&self) -> ProxyResult<()> {
        self.set_status(ConnectionStatus::Connecting, None, None);

        match self.inner.transport.start().await {
            Ok(()) => {
                self.inner.reconnect.reset();
                self.set_status(
                    ConnectionStatus::Connected { connected_at: Utc::now() },
                    None,
                    None,
                );
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.set_status(
                    ConnectionStatus::Error { message: message.clone() },
                    Some(message),
                    None,
                );
                if self.inner.auto_reconnect && self.owns_reconnection() {
                    self.schedule_reconnect();
                }
                Err(e.into())
            }
        }
    }

    /// Whether this manager drives reconnection itself. The SSE transport
    /// re-opens its own stream; stdio children are restarted here.
    fn owns_reconnection(&self) -> bool {
        self.inner.transport.kind() == TransportKind::Stdio
    }

    fn schedule_reconnect(&self) {
        let attempt = self.inner.reconnect.attempt_count() + 1;
        let exhausted = Arc::new(StdMutex::new(false));

        let retry_manager = self.clone();
        let exhausted_manager = self.clone();
        let exhausted_flag = Arc::clone(&exhausted);
        self.inner.reconnect.schedule(
            move || {
                tokio::spawn(async move {
                    let _ = retry_manager.connect_attempt().await;
                });
            },
            move || {
                *exhausted_flag.lock().expect("flag mutex poisoned") = true;
                warn!(server = %exhausted_manager.inner.name, "reconnect attempts exhausted");
                exhausted_manager.set_status(
                    ConnectionStatus::Error {
                        message: "reconnect attempts exhausted".to_string(),
                    },
                    Some("reconnect attempts exhausted".to_string()),
                    None,
                );
            },
        );

        if !*exhausted.lock().expect("flag mutex poisoned") {
            self.set_status(
                ConnectionStatus::Reconnecting { attempt },
                None,
                Some(attempt),
            );
        }
    }

    fn spawn_supervisor(inner: &Arc<ConnInner>) -> JoinHandle<()> {
        let weak: Weak<ConnInner> = Arc::downgrade(inner);
        let mut events = inner.transport.subscribe();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "supervisor lagged behind transport events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                let manager = ConnectionManager { inner };

                match event {
                    TransportEvent::Connected { .. } => {
                        // covers the SSE transport re-opening its stream
                        if !manager.status().is_connected() {
                            manager.inner.reconnect.reset();
                            manager.set_status(
                                ConnectionStatus::Connected { connected_at: Utc::now() },
                                None,
                                None,
                            );
                        }
                    }
                    TransportEvent::Closed { reason } => manager.handle_closed(reason),
                    TransportEvent::Error { message } => {
                        debug!(server = %manager.inner.name, "transport error: {message}");
                    }
                    TransportEvent::Message(_) => {}
                }
            }
        })
    }

    fn handle_closed(&self, reason: Option<String>) {
        if matches!(self.status(), ConnectionStatus::Terminated) {
            return;
        }

        // An SSE transport reports exhaustion of its own retry budget as a
        // close reason; that ends in Error regardless of the current state.
        if reason.as_deref().is_some_and(|r| r.contains("exhausted")) {
            self.set_status(
                ConnectionStatus::Error { message: "reconnect attempts exhausted".to_string() },
                reason,
                None,
            );
            return;
        }

        match self.status() {
            // already torn down, or the close was initiated here
            ConnectionStatus::Disconnected => return,
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting { .. } => return,
            ConnectionStatus::Terminated
            | ConnectionStatus::Connected { .. }
            | ConnectionStatus::Error { .. } => {}
        }

        let is_failure = reason
            .as_deref()
            .is_some_and(|r| r.starts_with("exit status") && r != "exit status 0");

        if is_failure {
            let message = reason.clone().unwrap_or_else(|| "connection failed".to_string());
            self.set_status(ConnectionStatus::Error { message }, reason.clone(), None);
        } else {
            self.set_status(ConnectionStatus::Disconnected, reason.clone(), None);
        }

        if self.inner.auto_reconnect
            && self.owns_reconnection()
            && !reason.as_deref().is_some_and(|r| r == "closed")
        {
            self.schedule_reconnect();
        }
    }

    /// Manually reconnect. Fails while connected or connecting; resets the
    /// backoff before attempting.
    pub async fn reconnect(&self) -> ProxyResult<()> {
        match self.status() {
            ConnectionStatus::Connected { .. } => {
                return Err(ProxyError::InvalidOperation {
                    server: self.inner.name.clone(),
                    reason: "already connected".to_string(),
                });
            }
            ConnectionStatus::Connecting => {
                return Err(ProxyError::InvalidOperation {
                    server: self.inner.name.clone(),
                    reason: "connection attempt already in progress".to_string(),
                });
            }
            _ => {}
        }
        self.inner.reconnect.reset();
        self.connect_attempt().await
    }

    /// Manually disconnect. Fails unless currently connected; cancels any
    /// scheduled reconnect.
    pub async fn disconnect(&self) -> ProxyResult<()> {
        if !self.status().is_connected() {
            return Err(ProxyError::InvalidOperation {
                server: self.inner.name.clone(),
                reason: "not connected".to_string(),
            });
        }
        self.inner.reconnect.cancel();
        self.set_status(
            ConnectionStatus::Disconnected,
            Some("manual_disconnect".to_string()),
            None,
        );
        self.inner.transport.close().await?;
        Ok(())
    }

    /// Tear the connection down for good. Valid from any state.
    pub async fn shutdown(&self) {
        self.inner.reconnect.cancel();
        self.set_status(ConnectionStatus::Terminated, None, None);
        if let Err(e) = self.inner.transport.close().await {
            debug!(server = %self.inner.name, "close during shutdown failed: {e}");
        }
        if let Some(supervisor) = self
            .inner
            .supervisor
            .lock()
            .expect("supervisor mutex poisoned")
            .take()
        {
            supervisor.abort();
        }
    }

    /// Send a correlated request to this server.
    ///
    /// Fails fast with [`ProxyError::ServerNotConnected`] when the server
    /// is not currently connected; callers never block on a reconnect.
    pub async fn request(&self, message: Value, timeout: Option<Duration>) -> ProxyResult<Value> {
        if !self.status().is_connected() {
            return Err(ProxyError::ServerNotConnected(self.inner.name.clone()));
        }
        let timeout = timeout.or(self.inner.default_timeout);
        Ok(self.inner.transport.request(message, timeout).await?)
    }

    /// Send a notification to this server.
    pub async fn notify(&self, message: Value) -> ProxyResult<()> {
        if !self.status().is_connected() {
            return Err(ProxyError::ServerNotConnected(self.inner.name.clone()));
        }
        Ok(self.inner.transport.send(message).await?)
    }
}
