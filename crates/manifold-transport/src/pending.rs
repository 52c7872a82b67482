//! Pending-request correlation table.
//!
//! Every outgoing request registers its id here before it is written to the
//! wire. Each entry owns a deadline timer; whichever of response, timeout,
//! or connection loss arrives first settles the entry, and settlement is
//! exactly-once because removal from the map happens before the resolver is
//! consumed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use manifold_core::{JsonRpcResponse, RequestId};

use crate::error::{TransportError, TransportResult};

struct Pending {
    resolver: oneshot::Sender<TransportResult<Value>>,
    deadline: JoinHandle<()>,
}

/// Shared table of in-flight requests for one transport.
///
/// Only the owning transport registers entries; resolutions arrive from the
/// reader task, the deadline timers, and connection teardown, all of which
/// go through the same interior map.
#[derive(Clone)]
pub struct PendingRequests {
    inner: Arc<StdMutex<HashMap<RequestId, Pending>>>,
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests").field("len", &self.len()).finish()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Register a request id and arm its deadline timer.
    ///
    /// The returned receiver resolves exactly once: with the correlated
    /// response, a [`TransportError::RequestTimeout`] when the deadline
    /// fires, or a [`TransportError::ConnectionLost`] on teardown.
    pub fn register(
        &self,
        id: RequestId,
        timeout: Duration,
    ) -> oneshot::Receiver<TransportResult<Value>> {
        let (tx, rx) = oneshot::channel();

        let table = Arc::clone(&self.inner);
        let timer_id = id.clone();
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let entry = table.lock().expect("pending table poisoned").remove(&timer_id);
            if let Some(pending) = entry {
                debug!(id = %timer_id, timeout_ms, "request deadline fired");
                let _ = pending.resolver.send(Err(TransportError::RequestTimeout(timeout_ms)));
            }
        });

        let previous = self
            .inner
            .lock()
            .expect("pending table poisoned")
            .insert(id.clone(), Pending { resolver: tx, deadline });
        if let Some(stale) = previous {
            // Duplicate id from the caller; the older entry can never be
            // answered distinguishably, so fail it now.
            warn!(id = %id, "duplicate request id replaced in pending table");
            stale.deadline.abort();
            let _ = stale
                .resolver
                .send(Err(TransportError::ProtocolError(format!("duplicate request id: {id}"))));
        }

        rx
    }

    /// Settle the entry matching a response's id.
    ///
    /// Returns `false` when no entry matched, in which case the caller
    /// forwards the message to the uncorrelated stream.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.clone() else {
            return false;
        };
        let entry = self.inner.lock().expect("pending table poisoned").remove(&id);
        let Some(pending) = entry else {
            return false;
        };
        pending.deadline.abort();

        let outcome = match response.error {
            Some(error) => Err(TransportError::from(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = pending.resolver.send(outcome);
        true
    }

    /// Fail a single entry (e.g. a write error for that specific request).
    pub fn fail(&self, id: &RequestId, error: TransportError) {
        let entry = self.inner.lock().expect("pending table poisoned").remove(id);
        if let Some(pending) = entry {
            pending.deadline.abort();
            let _ = pending.resolver.send(Err(error));
        }
    }

    /// Fail every in-flight request, used when the connection drops.
    pub fn fail_all(&self, error: &TransportError) {
        let drained: Vec<Pending> = {
            let mut table = self.inner.lock().expect("pending table poisoned");
            table.drain().map(|(_, pending)| pending).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), %error, "failing all pending requests");
        }
        for pending in drained {
            pending.deadline.abort();
            let _ = pending.resolver.send(Err(error.clone()));
        }
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table poisoned").len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::JsonRpcError;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn response_ok(id: RequestId, result: Value) -> JsonRpcResponse {
        JsonRpcResponse::success(id, result)
    }

    #[tokio::test]
    async fn test_resolve_settles_and_removes() {
        let table = PendingRequests::new();
        let rx = table.register(RequestId::from("r1"), Duration::from_secs(5));
        assert_eq!(table.len(), 1);

        assert!(table.resolve(response_ok(RequestId::from("r1"), json!({"ok": true}))));
        assert_eq!(table.len(), 0);
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_error_response_rejects() {
        let table = PendingRequests::new();
        let rx = table.register(RequestId::from("r1"), Duration::from_secs(5));

        let resp = JsonRpcResponse::error(
            Some(RequestId::from("r1")),
            JsonRpcError { code: -32000, message: "boom".to_string(), data: None },
        );
        assert!(table.resolve(resp));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "JSON-RPC error -32000: boom");
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_consumed() {
        let table = PendingRequests::new();
        let _rx = table.register(RequestId::from("r1"), Duration::from_secs(5));
        assert!(!table.resolve(response_ok(RequestId::from("other"), Value::Null)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_and_removes() {
        let table = PendingRequests::new();
        let rx = table.register(RequestId::from("slow"), Duration::from_millis(250));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err, TransportError::RequestTimeout(250));
        assert_eq!(table.len(), 0);

        // A late response for the timed-out id is uncorrelated.
        assert!(!table.resolve(response_ok(RequestId::from("slow"), Value::Null)));
    }

    #[tokio::test]
    async fn test_fail_all_on_connection_loss() {
        let table = PendingRequests::new();
        let rx1 = table.register(RequestId::from("a"), Duration::from_secs(5));
        let rx2 = table.register(RequestId::from("b"), Duration::from_secs(5));

        table.fail_all(&TransportError::ConnectionLost("connection lost".to_string()));
        assert!(table.is_empty());
        assert!(matches!(rx1.await.unwrap(), Err(TransportError::ConnectionLost(_))));
        assert!(matches!(rx2.await.unwrap(), Err(TransportError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_responses_resolve_out_of_order() {
        let table = PendingRequests::new();
        let rx1 = table.register(RequestId::from("first"), Duration::from_secs(5));
        let rx2 = table.register(RequestId::from("second"), Duration::from_secs(5));

        assert!(table.resolve(response_ok(RequestId::from("second"), json!(2))));
        assert!(table.resolve(response_ok(RequestId::from("first"), json!(1))));
        assert_eq!(rx2.await.unwrap().unwrap(), json!(2));
        assert_eq!(rx1.await.unwrap().unwrap(), json!(1));
    }
}
