//! JSON-RPC 2.0 message types.
//!
//! Wire types for the framing both transports speak: requests, responses,
//! notifications, and error objects. Responses carry either `result` or
//! `error`, never both.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC version marker that serializes as the literal `"2.0"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "Invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// A request identifier: a string or an integer per the JSON-RPC spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String identifier
    String(String),
    /// Numeric identifier
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// JSON-RPC request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Request identifier
    pub id: RequestId,
    /// Request method name
    pub method: String,
    /// Request parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new request.
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification message (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Notification method name
    pub method: String,
    /// Notification parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i64,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Method-not-found error (-32601).
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    /// Invalid-params error (-32602).
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    /// Internal error (-32603).
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// JSON-RPC response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Identifier of the request this answers; `null` only for parse errors.
    pub id: Option<RequestId>,
    /// Successful result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a success response for a request id.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response for a request id.
    #[must_use]
    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Any JSON-RPC message the proxy can observe on a wire.
///
/// Classification looks at structure, not order: a `method` member marks a
/// request or notification (distinguished by the presence of `id`), anything
/// else with an `id` is a response.
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    /// A request (has `method` and `id`)
    Request(JsonRpcRequest),
    /// A notification (has `method`, no `id`)
    Notification(JsonRpcNotification),
    /// A response (no `method`)
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Classify a raw JSON value into a message variant.
    ///
    /// # Errors
    ///
    /// Returns the underlying deserialization error when the value matches no
    /// variant shape.
    pub fn classify(value: Value) -> Result<Self, serde_json::Error> {
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        if has_method && has_id {
            serde_json::from_value(value).map(Self::Request)
        } else if has_method {
            serde_json::from_value(value).map(Self::Notification)
        } else {
            serde_json::from_value(value).map(Self::Response)
        }
    }

    /// The correlation id, when the message carries one.
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Notification(_) => None,
            Self::Response(r) => r.id.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::new("1700000000000_deadbeef", "tools/list", None);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": "1700000000000_deadbeef", "method": "tools/list"})
        );
    }

    #[test]
    fn test_version_rejects_mismatch() {
        let err = serde_json::from_value::<JsonRpcRequest>(
            json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid JSON-RPC version"));
    }

    #[test]
    fn test_classify_request() {
        let msg =
            JsonRpcMessage::classify(json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call"}))
                .unwrap();
        assert!(matches!(msg, JsonRpcMessage::Request(_)));
        assert_eq!(msg.id(), Some(&RequestId::Number(7)));
    }

    #[test]
    fn test_classify_notification() {
        let msg = JsonRpcMessage::classify(
            json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
        )
        .unwrap();
        assert!(matches!(msg, JsonRpcMessage::Notification(_)));
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn test_classify_response_with_error() {
        let msg = JsonRpcMessage::classify(
            json!({"jsonrpc": "2.0", "id": "abc", "error": {"code": -32601, "message": "nope"}}),
        )
        .unwrap();
        let JsonRpcMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        let error = resp.error.unwrap();
        assert_eq!(error.to_string(), "JSON-RPC error -32601: nope");
    }

    #[test]
    fn test_null_id_is_notificationless_response() {
        // A response to an unparseable request has `id: null`.
        let msg = JsonRpcMessage::classify(
            json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "parse"}}),
        )
        .unwrap();
        assert!(matches!(msg, JsonRpcMessage::Response(_)));
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn test_response_mutual_exclusion_shape() {
        let ok = JsonRpcResponse::success(RequestId::from(1), json!({"tools": []}));
        let value = serde_json::to_value(&ok).unwrap();
        assert!(value.get("error").is_none());

        let err = JsonRpcResponse::error(Some(RequestId::from(1)), JsonRpcError::internal("x"));
        let value = serde_json::to_value(&err).unwrap();
        assert!(value.get("result").is_none());
    }
}
