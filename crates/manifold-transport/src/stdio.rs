//! Stdio transport: a child MCP server spoken to over stdin/stdout.
//!
//! Newline-delimited JSON-RPC. The transport owns the child process: a
//! writer task feeds stdin, a reader task drains stdout and settles the
//! pending table, stderr is redacted and forwarded to the logs, and a
//! waiter task observes the exit status. When the child exits, every
//! in-flight request fails with a connection-lost error; a restarted child
//! is a new process, so nothing is replayed.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, trace, warn};

use manifold_core::{JsonRpcMessage, RequestId, generate_request_id, redact_secrets};

use crate::error::{TransportError, TransportResult};
use crate::events::TransportEventEmitter;
use crate::pending::PendingRequests;
use crate::traits::{Transport, TransportKind};

/// Configuration for a stdio transport.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Command to execute
    pub command: String,
    /// Arguments to pass to the command
    pub args: Vec<String>,
    /// Environment variables set for the child
    pub env: HashMap<String, String>,
    /// Default per-request deadline
    pub request_timeout: Duration,
    /// Inbound lines larger than this are dropped with a warning
    pub max_message_size: usize,
    /// Grace period between kill signal and forced kill on close
    pub shutdown_timeout: Duration,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            request_timeout: Duration::from_secs(10),
            max_message_size: 10 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Stdio transport implementation.
///
/// `start` is re-runnable: after the child exits, calling it again spawns a
/// fresh process on the same transport instance. The connection manager
/// relies on this for reconnection.
#[derive(Debug)]
pub struct StdioTransport {
    config: StdioConfig,
    pending: PendingRequests,
    events: TransportEventEmitter,
    /// Sender half of the stdin writer channel (std mutex, cloned out before await)
    stdin_tx: Arc<StdMutex<Option<mpsc::Sender<String>>>>,
    /// Signals the waiter task to shut the child down
    shutdown_tx: Arc<StdMutex<Option<oneshot::Sender<()>>>>,
    connected: Arc<StdMutex<bool>>,
}

impl StdioTransport {
    /// Create a transport for the given configuration.
    #[must_use]
    pub fn new(config: StdioConfig) -> Self {
        let (events, _) = TransportEventEmitter::new();
        Self {
            config,
            pending: PendingRequests::new(),
            events,
            stdin_tx: Arc::new(StdMutex::new(None)),
            shutdown_tx: Arc::new(StdMutex::new(None)),
            connected: Arc::new(StdMutex::new(false)),
        }
    }

    fn set_connected(&self, value: bool) {
        *self.connected.lock().expect("state mutex poisoned") = value;
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().expect("state mutex poisoned")
    }

    fn serialize_line(message: &Value) -> TransportResult<String> {
        let line = serde_json::to_string(message)?;
        // Newline-delimited framing: an embedded newline would split one
        // message into two frames.
        if line.contains('\n') || line.contains('\r') {
            return Err(TransportError::ProtocolError(
                "message contains embedded newlines".to_string(),
            ));
        }
        Ok(line)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn endpoint(&self) -> String {
        format!("stdio://{}", self.config.command)
    }

    async fn start(&self) -> TransportResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.config.command.is_empty() {
            return Err(TransportError::ConfigurationError(
                "command cannot be empty".to_string(),
            ));
        }

        debug!(command = %self.config.command, args = ?self.config.args, "spawning downstream server");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to spawn {}: {e}",
                self.config.command
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectionFailed("child stdin was not piped".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectionFailed("child stdout was not piped".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::ConnectionFailed("child stderr was not piped".to_string())
        })?;

        // stdin writer
        let (stdin_sender, mut stdin_rx) = mpsc::channel::<String>(100);
        tokio::spawn(async move {
            let mut writer = FramedWrite::new(stdin, LinesCodec::new());
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = writer.send(line).await {
                    error!("failed to write to child stdin: {e}");
                    break;
                }
            }
            debug!("stdin writer task completed");
        });

        // stdout reader: settle pending requests, forward the rest
        {
            let pending = self.pending.clone();
            let events = self.events.clone();
            let max_size = self.config.max_message_size;
            tokio::spawn(async move {
                let mut lines = FramedRead::new(BufReader::new(stdout), LinesCodec::new());
                while let Some(result) = lines.next().await {
                    let line = match result {
                        Ok(line) => line,
                        Err(e) => {
                            error!("failed to read from child stdout: {e}");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if line.len() > max_size {
                        warn!(size = line.len(), "dropping oversized message from child");
                        continue;
                    }
                    trace!(size = line.len(), "line from child stdout");
                    match serde_json::from_str::<Value>(&line) {
                        Ok(value) => match JsonRpcMessage::classify(value.clone()) {
                            Ok(JsonRpcMessage::Response(resp)) => {
                                if !pending.resolve(resp) {
                                    events.emit_message(value);
                                }
                            }
                            Ok(_) => events.emit_message(value),
                            Err(e) => {
                                warn!("unclassifiable message from child: {e}");
                                events.emit_error(format!("unclassifiable message: {e}"));
                            }
                        },
                        Err(e) => {
                            warn!("invalid JSON from child: {e}");
                            events.emit_error(format!("invalid JSON: {e}"));
                        }
                    }
                }
                debug!("stdout reader task completed");
            });
        }

        // stderr is forwarded to our logs, redacted
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "manifold::downstream", "{}", redact_secrets(&line));
            }
        });

        // waiter: observes exit, drives teardown
        let (shutdown_sender, mut shutdown_rx) = oneshot::channel::<()>();
        {
            let pending = self.pending.clone();
            let events = self.events.clone();
            let connected = Arc::clone(&self.connected);
            let stdin_slot = Arc::clone(&self.stdin_tx);
            let shutdown_timeout = self.config.shutdown_timeout;
            tokio::spawn(async move {
                let reason = tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => {
                            let code = status.code().map_or_else(
                                || "signal".to_string(),
                                |c| c.to_string(),
                            );
                            warn!(%code, "downstream server exited");
                            Some(format!("exit status {code}"))
                        }
                        Err(e) => Some(format!("wait failed: {e}")),
                    },
                    _ = &mut shutdown_rx => {
                        if let Err(e) = child.start_kill() {
                            warn!("failed to signal child: {e}");
                        }
                        if timeout(shutdown_timeout, child.wait()).await.is_err() {
                            warn!("child ignored kill signal, forcing");
                            let _ = child.kill().await;
                        }
                        Some("closed".to_string())
                    }
                };

                *connected.lock().expect("state mutex poisoned") = false;
                *stdin_slot.lock().expect("state mutex poisoned") = None;
                pending.fail_all(&TransportError::ConnectionLost("connection lost".to_string()));
                events.emit_closed(reason);
            });
        }

        *self.stdin_tx.lock().expect("state mutex poisoned") = Some(stdin_sender);
        *self.shutdown_tx.lock().expect("state mutex poisoned") = Some(shutdown_sender);
        self.set_connected(true);
        self.events.emit_connected(self.endpoint());
        debug!(endpoint = %self.endpoint(), "stdio transport connected");
        Ok(())
    }

    async fn send(&self, message: Value) -> TransportResult<()> {
        let line = Self::serialize_line(&message)?;
        let sender = self
            .stdin_tx
            .lock()
            .expect("state mutex poisoned")
            .clone()
            .ok_or_else(|| TransportError::NotConnected(self.endpoint()))?;
        sender
            .send(line)
            .await
            .map_err(|_| TransportError::ConnectionLost("stdin channel closed".to_string()))
    }

    async fn request(&self, mut message: Value, deadline: Option<Duration>) -> TransportResult<Value> {
        let obj = message.as_object_mut().ok_or_else(|| {
            TransportError::ProtocolError("request must be a JSON object".to_string())
        })?;
        if !obj.contains_key("id") {
            obj.insert("id".to_string(), Value::String(generate_request_id()));
        }
        let id: RequestId = serde_json::from_value(obj["id"].clone())
            .map_err(|_| TransportError::ProtocolError("request id must be a string or integer".to_string()))?;

        let timeout = deadline.unwrap_or(self.config.request_timeout);
        let rx = self.pending.register(id.clone(), timeout);

        if let Err(e) = self.send(message).await {
            self.pending.fail(&id, e.clone());
            // drain the failure we just queued
            let _ = rx.await;
            return Err(e);
        }

        rx.await
            .map_err(|_| TransportError::ConnectionLost("transport closed".to_string()))?
    }

    async fn close(&self) -> TransportResult<()> {
        let shutdown = self.shutdown_tx.lock().expect("state mutex poisoned").take();
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        self.set_connected(false);
        self.pending
            .fail_all(&TransportError::ConnectionLost("connection closed".to_string()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<crate::events::TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TransportEvent;
    use serde_json::json;

    #[test]
    fn test_serialize_rejects_embedded_newlines() {
        // Escaped newlines inside JSON strings serialize as two characters
        // and are fine; only literal newline bytes break framing.
        let fine = json!({"jsonrpc": "2.0", "method": "log", "params": {"text": "a\nb"}});
        assert!(StdioTransport::serialize_line(&fine).is_ok());
    }

    #[test]
    fn test_empty_command_fails_configuration() {
        let transport = StdioTransport::new(StdioConfig::default());
        let err = tokio_test::block_on(transport.start()).unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_send_before_start_is_not_connected() {
        let transport = StdioTransport::new(StdioConfig {
            command: "cat".to_string(),
            ..Default::default()
        });
        let err = transport.send(json!({"jsonrpc": "2.0", "method": "ping"})).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_echo_round_trip_with_cat() {
        // `cat` echoes our request line verbatim, which reads back as a
        // message whose id matches the pending entry. The "response" has a
        // `method` member, so it classifies as a request, not a response;
        // it must therefore arrive on the event stream instead.
        let transport = StdioTransport::new(StdioConfig {
            command: "cat".to_string(),
            request_timeout: Duration::from_millis(300),
            ..Default::default()
        });
        if transport.start().await.is_err() {
            return; // process spawning restricted in this environment
        }
        let mut events = transport.subscribe();

        let err = transport
            .request(json!({"jsonrpc": "2.0", "method": "tools/list"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RequestTimeout(300)));

        // the echoed request surfaced as an uncorrelated message
        let mut saw_echo = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransportEvent::Message(_)) {
                saw_echo = true;
            }
        }
        assert!(saw_echo);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_child_exit_fails_pending_and_emits_closed() {
        let transport = StdioTransport::new(StdioConfig {
            command: "true".to_string(),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        if transport.start().await.is_err() {
            return;
        }
        let mut events = transport.subscribe();

        loop {
            match events.recv().await {
                Ok(TransportEvent::Closed { reason }) => {
                    let reason = reason.unwrap_or_default();
                    assert!(reason.starts_with("exit status"), "reason was {reason:?}");
                    break;
                }
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    }
}
