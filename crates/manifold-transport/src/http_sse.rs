//! HTTP transport with a Server-Sent Events return channel.
//!
//! Requests go out as `POST <url>` with a JSON body; the downstream pushes
//! messages back over `GET <url>` with `Accept: text/event-stream`. Some
//! servers answer the POST body directly instead of (or in addition to)
//! pushing over SSE, so both paths feed the same dispatch: correlated
//! responses settle the pending table, everything else surfaces as an
//! uncorrelated message event.
//!
//! A broken SSE stream fails all in-flight requests and re-opens through
//! the transport's own [`ReconnectManager`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, trace, warn};

use manifold_core::{JsonRpcMessage, RequestId, generate_request_id, redact_url};

use crate::error::{TransportError, TransportResult};
use crate::events::TransportEventEmitter;
use crate::pending::PendingRequests;
use crate::reconnect::{ReconnectManager, ReconnectPolicy};
use crate::traits::{AuthHeaders, Transport, TransportKind};

/// Configuration for an HTTP/SSE transport.
#[derive(Debug, Clone)]
pub struct HttpSseConfig {
    /// Endpoint serving both the SSE stream (GET) and requests (POST)
    pub url: String,
    /// Default per-request deadline
    pub request_timeout: Duration,
    /// Backoff policy for re-opening a broken SSE stream
    pub reconnect: ReconnectPolicy,
    /// Additional headers attached to every request
    pub headers: HashMap<String, String>,
}

impl Default for HttpSseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            headers: HashMap::new(),
        }
    }
}

/// HTTP/SSE transport implementation.
pub struct HttpSseTransport {
    config: HttpSseConfig,
    http: reqwest::Client,
    pending: PendingRequests,
    events: TransportEventEmitter,
    reconnect: ReconnectManager,
    auth: Option<Arc<dyn AuthHeaders>>,
    last_event_id: Arc<StdMutex<Option<String>>>,
    shutdown: watch::Sender<bool>,
    connected: Arc<StdMutex<bool>>,
}

impl std::fmt::Debug for HttpSseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSseTransport")
            .field("url", &redact_url(&self.config.url))
            .field("pending", &self.pending)
            .finish()
    }
}

impl HttpSseTransport {
    /// Create a transport for the given configuration without auth.
    #[must_use]
    pub fn new(config: HttpSseConfig) -> Self {
        Self::with_auth(config, None)
    }

    /// Create a transport with an optional authorization header source.
    #[must_use]
    pub fn with_auth(config: HttpSseConfig, auth: Option<Arc<dyn AuthHeaders>>) -> Self {
        let (events, _) = TransportEventEmitter::new();
        let (shutdown, _) = watch::channel(false);
        let reconnect = ReconnectManager::new(config.reconnect.clone());
        let http = reqwest::Client::builder()
            .build()
            .expect("failed to build HTTP client");
        Self {
            config,
            http,
            pending: PendingRequests::new(),
            events,
            reconnect,
            auth,
            last_event_id: Arc::new(StdMutex::new(None)),
            shutdown,
            connected: Arc::new(StdMutex::new(false)),
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().expect("state mutex poisoned")
    }

    async fn apply_headers(
        &self,
        mut request: reqwest::RequestBuilder,
    ) -> TransportResult<reqwest::RequestBuilder> {
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(auth) = &self.auth {
            for (key, value) in auth.auth_headers().await? {
                request = request.header(&key, value);
            }
        }
        Ok(request)
    }

    /// The long-running SSE loop: open, drain, fail pending on break,
    /// back off, repeat.
    #[allow(clippy::too_many_lines)]
    fn spawn_sse_loop(&self) {
        let config = self.config.clone();
        let http = self.http.clone();
        let pending = self.pending.clone();
        let events = self.events.clone();
        let reconnect = self.reconnect.clone();
        let auth = self.auth.clone();
        let last_event_id = Arc::clone(&self.last_event_id);
        let connected = Arc::clone(&self.connected);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let mut request = http
                    .get(&config.url)
                    .header(header::ACCEPT, "text/event-stream")
                    .header(header::CACHE_CONTROL, "no-cache");
                for (key, value) in &config.headers {
                    request = request.header(key, value);
                }
                if let Some(auth) = &auth {
                    match auth.auth_headers().await {
                        Ok(headers) => {
                            for (key, value) in headers {
                                request = request.header(&key, value);
                            }
                        }
                        Err(e) => {
                            events.emit_error(format!("auth headers unavailable: {e}"));
                        }
                    }
                }
                let resume_from = last_event_id.lock().expect("state mutex poisoned").clone();
                if let Some(id) = resume_from {
                    request = request.header("Last-Event-ID", id);
                }

                let stream_end_reason = match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(url = %redact_url(&config.url), "SSE stream established");
                        reconnect.reset();
                        *connected.lock().expect("state mutex poisoned") = true;
                        events.emit_connected(redact_url(&config.url));

                        let reason =
                            drain_sse_stream(response, &pending, &events, &last_event_id, &mut shutdown)
                                .await;
                        *connected.lock().expect("state mutex poisoned") = false;
                        reason
                    }
                    Ok(response) => {
                        format!("SSE handshake rejected with status {}", response.status())
                    }
                    Err(e) => format!("SSE connection failed: {e}"),
                };

                if *shutdown.borrow() {
                    break;
                }

                pending.fail_all(&TransportError::ConnectionLost("connection lost".to_string()));
                events.emit_closed(Some(stream_end_reason.clone()));
                warn!(reason = %stream_end_reason, "SSE stream interrupted");

                let (retry_tx, retry_rx) = oneshot::channel::<()>();
                let (halt_tx, halt_rx) = oneshot::channel::<()>();
                reconnect.schedule(
                    move || {
                        let _ = retry_tx.send(());
                    },
                    move || {
                        let _ = halt_tx.send(());
                    },
                );

                tokio::select! {
                    _ = retry_rx => {}
                    _ = halt_rx => {
                        events.emit_closed(Some("reconnect attempts exhausted".to_string()));
                        break;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("SSE loop terminated");
        });
    }
}

/// Read an open SSE response until it breaks; returns the break reason.
async fn drain_sse_stream(
    response: reqwest::Response,
    pending: &PendingRequests,
    events: &TransportEventEmitter,
    last_event_id: &Arc<StdMutex<Option<String>>>,
    shutdown: &mut watch::Receiver<bool>,
) -> String {
    let mut body = response.bytes_stream();
    let mut buffer = String::new();

    loop {
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = shutdown.changed() => return "closed".to_string(),
        };
        match chunk {
            Some(Ok(bytes)) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find("\n\n") {
                    let block = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);
                    let event = parse_sse_block(&block);
                    if let Some(id) = event.id {
                        *last_event_id.lock().expect("state mutex poisoned") = Some(id);
                    }
                    if event.data.is_empty() {
                        continue;
                    }
                    dispatch_incoming(&event.data, pending, events);
                }
            }
            Some(Err(e)) => return format!("SSE read error: {e}"),
            None => return "SSE stream ended".to_string(),
        }
    }
}

/// One parsed SSE event block.
#[derive(Debug, Default, PartialEq, Eq)]
struct SseEvent {
    event: Option<String>,
    id: Option<String>,
    data: String,
}

/// Parse a double-newline-delimited SSE block into its fields.
fn parse_sse_block(block: &str) -> SseEvent {
    let mut parsed = SseEvent::default();
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(pos) => (&line[..pos], line[pos + 1..].strip_prefix(' ').unwrap_or(&line[pos + 1..])),
            None => (line, ""),
        };
        match field {
            "event" => parsed.event = Some(value.to_string()),
            "data" => data_lines.push(value.to_string()),
            "id" => parsed.id = Some(value.to_string()),
            "retry" => trace!(retry = value, "SSE retry hint ignored"),
            _ => trace!(field, "unknown SSE field"),
        }
    }
    parsed.data = data_lines.join("\n");
    parsed
}

/// Route one inbound payload: settle a pending request or surface it as an
/// uncorrelated message.
fn dispatch_incoming(payload: &str, pending: &PendingRequests, events: &TransportEventEmitter) {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => match JsonRpcMessage::classify(value.clone()) {
            Ok(JsonRpcMessage::Response(resp)) => {
                if !pending.resolve(resp) {
                    events.emit_message(value);
                }
            }
            Ok(_) => events.emit_message(value),
            Err(e) => {
                warn!("unclassifiable downstream message: {e}");
                events.emit_error(format!("unclassifiable message: {e}"));
            }
        },
        Err(e) => {
            warn!("invalid JSON on SSE stream: {e}");
            events.emit_error(format!("invalid JSON: {e}"));
        }
    }
}

#[async_trait]
impl Transport for HttpSseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpSse
    }

    fn endpoint(&self) -> String {
        redact_url(&self.config.url)
    }

    async fn start(&self) -> TransportResult<()> {
        if self.config.url.is_empty() {
            return Err(TransportError::ConfigurationError("url cannot be empty".to_string()));
        }
        url::Url::parse(&self.config.url)
            .map_err(|e| TransportError::ConfigurationError(format!("invalid url: {e}")))?;

        // Re-arm after a previous close.
        self.shutdown.send_replace(false);
        self.reconnect.reset();
        self.spawn_sse_loop();
        Ok(())
    }

    async fn send(&self, message: Value) -> TransportResult<()> {
        let request = self
            .http
            .post(&self.config.url)
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(self.config.request_timeout)
            .json(&message);
        let request = self.apply_headers(request).await?;

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(format!("HTTP POST failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::SendFailed(format!(
                "HTTP POST failed with status {status}"
            )));
        }

        // Servers that answer in the POST body feed the same dispatch path
        // as SSE-delivered messages.
        if let Ok(bytes) = response.bytes().await
            && !bytes.is_empty()
            && let Ok(text) = std::str::from_utf8(&bytes)
            && !text.trim().is_empty()
        {
            dispatch_incoming(text.trim(), &self.pending, &self.events);
        }
        Ok(())
    }

    async fn request(&self, mut message: Value, deadline: Option<Duration>) -> TransportResult<Value> {
        let obj = message.as_object_mut().ok_or_else(|| {
            TransportError::ProtocolError("request must be a JSON object".to_string())
        })?;
        if !obj.contains_key("id") {
            obj.insert("id".to_string(), Value::String(generate_request_id()));
        }
        let id: RequestId = serde_json::from_value(obj["id"].clone()).map_err(|_| {
            TransportError::ProtocolError("request id must be a string or integer".to_string())
        })?;

        let timeout = deadline.unwrap_or(self.config.request_timeout);
        let rx = self.pending.register(id.clone(), timeout);

        if let Err(e) = self.send(message).await {
            self.pending.fail(&id, e.clone());
            let _ = rx.await;
            return Err(e);
        }

        rx.await
            .map_err(|_| TransportError::ConnectionLost("transport closed".to_string()))?
    }

    async fn close(&self) -> TransportResult<()> {
        self.shutdown.send_replace(true);
        self.reconnect.cancel();
        *self.connected.lock().expect("state mutex poisoned") = false;
        self.pending
            .fail_all(&TransportError::ConnectionLost("connection closed".to_string()));
        self.events.emit_closed(Some("closed".to_string()));
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
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_sse_block_fields() {
        let event = parse_sse_block("event: message\nid: 42\ndata: {\"a\":1}\ndata: {\"b\":2}");
        assert_eq!(event.event.as_deref(), Some("message"));
        assert_eq!(event.id.as_deref(), Some("42"));
        assert_eq!(event.data, "{\"a\":1}\n{\"b\":2}");
    }

    #[test]
    fn test_parse_sse_block_ignores_comments() {
        let event = parse_sse_block(": keep-alive\ndata: {}");
        assert_eq!(event.data, "{}");
    }

    #[tokio::test]
    async fn test_request_resolved_from_post_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/json"))
            .respond_with(move |req: &wiremock::Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": {"tools": []}
                }))
            })
            .mount(&server)
            .await;

        let transport = HttpSseTransport::new(HttpSseConfig {
            url: server.uri(),
            ..Default::default()
        });

        let result = transport
            .request(json!({"jsonrpc": "2.0", "method": "tools/list"}), None)
            .await
            .unwrap();
        assert_eq!(result, json!({"tools": []}));
        assert!(transport.pending.is_empty());
    }

    #[tokio::test]
    async fn test_downstream_jsonrpc_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(move |req: &wiremock::Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "error": {"code": -32601, "message": "Method not found: nope"}
                }))
            })
            .mount(&server)
            .await;

        let transport = HttpSseTransport::new(HttpSseConfig {
            url: server.uri(),
            ..Default::default()
        });

        let err = transport
            .request(json!({"jsonrpc": "2.0", "method": "nope"}), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "JSON-RPC error -32601: Method not found: nope");
    }

    #[tokio::test]
    async fn test_post_failure_fails_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let transport = HttpSseTransport::new(HttpSseConfig {
            url: server.uri(),
            ..Default::default()
        });
        let err = transport
            .request(json!({"jsonrpc": "2.0", "method": "tools/list"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
        assert!(transport.pending.is_empty());
    }

    #[tokio::test]
    async fn test_sse_notifications_reach_event_stream() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}\n",
            "\n",
        );
        Mock::given(method("GET"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let transport = HttpSseTransport::new(HttpSseConfig {
            url: server.uri(),
            reconnect: ReconnectPolicy {
                max_attempts: 1,
                initial_delay: Duration::from_millis(10),
                backoff_multiplier: 1.0,
                max_delay: Duration::from_millis(10),
            },
            ..Default::default()
        });
        let mut events = transport.subscribe();
        transport.start().await.unwrap();

        let mut saw_notification = false;
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Ok(TransportEvent::Message(value))) => {
                    assert_eq!(value["method"], "notifications/tools/list_changed");
                    saw_notification = true;
                    break;
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert!(saw_notification);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_url_fails_start() {
        let transport = HttpSseTransport::new(HttpSseConfig {
            url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            transport.start().await.unwrap_err(),
            TransportError::ConfigurationError(_)
        ));
    }
}
