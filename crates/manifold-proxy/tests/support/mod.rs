//! Scripted in-process transport for proxy tests.
#![allow(dead_code)] // not every test binary touches every helper

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use manifold_core::Tool;
use manifold_transport::{
    Transport, TransportError, TransportEvent, TransportEventEmitter, TransportKind,
    TransportResult,
};

/// A downstream stand-in with a fixed catalog and a scriptable number of
/// connection failures.
pub struct MockTransport {
    pub name: String,
    tools: StdMutex<Vec<Tool>>,
    fail_starts: AtomicU32,
    start_calls: AtomicU32,
    connected: AtomicBool,
    calls: StdMutex<Vec<(String, Value)>>,
    events: TransportEventEmitter,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport").field("name", &self.name).finish()
    }
}

impl MockTransport {
    pub fn new(name: &str, tools: Vec<Tool>) -> Self {
        let (events, _) = TransportEventEmitter::new();
        Self {
            name: name.to_string(),
            tools: StdMutex::new(tools),
            fail_starts: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            calls: StdMutex::new(Vec::new()),
            events,
        }
    }

    /// Make the next `n` start attempts fail.
    pub fn fail_next_starts(&self, n: u32) {
        self.fail_starts.store(n, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Tool calls received, as `(original_name, arguments)` pairs.
    pub fn received_calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    /// Simulate the child process exiting with a code.
    pub fn simulate_exit(&self, code: i32) {
        self.connected.store(false, Ordering::SeqCst);
        self.events.emit_closed(Some(format!("exit status {code}")));
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn endpoint(&self) -> String {
        format!("mock://{}", self.name)
    }

    async fn start(&self) -> TransportResult<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectionFailed("injected failure".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.events.emit_connected(self.endpoint());
        Ok(())
    }

    async fn send(&self, _message: Value) -> TransportResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(self.endpoint()));
        }
        Ok(())
    }

    async fn request(&self, message: Value, _timeout: Option<Duration>) -> TransportResult<Value> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(self.endpoint()));
        }
        match message["method"].as_str() {
            Some("tools/list") => {
                let tools = self.tools.lock().unwrap().clone();
                Ok(json!({"tools": tools}))
            }
            Some("tools/call") => {
                let name = message["params"]["name"].as_str().unwrap_or_default().to_string();
                let arguments = message["params"]["arguments"].clone();
                self.calls.lock().unwrap().push((name.clone(), arguments));
                Ok(json!({
                    "content": [{"type": "text", "text": format!("{} handled {}", self.name, name)}]
                }))
            }
            other => Err(TransportError::JsonRpc {
                code: -32601,
                message: format!("Method not found: {}", other.unwrap_or("?")),
            }),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.events.emit_closed(Some("closed".to_string()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
