//! Proxy configuration.
//!
//! Loading is a two-phase pipeline: parse the raw JSON into the strict
//! schema first, then substitute `${NAME}` / `${NAME:default}` environment
//! references in every string field. Both phases fail at startup; nothing
//! is deferred to first use.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use manifold_core::envsubst;
use manifold_transport::ReconnectPolicy;

use crate::error::{ProxyError, ProxyResult};
use crate::overrides::{OverrideSettings, ToolOverride};

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Downstream servers by name
    pub servers: BTreeMap<String, ServerConfig>,
    /// Override rules keyed by exact tool name or `*` glob
    #[serde(default)]
    pub tool_overrides: HashMap<String, ToolOverride>,
    /// Dynamic-override behavior switches
    #[serde(default)]
    pub override_settings: OverrideSettings,
    /// Global automatic reconnection policy
    #[serde(default)]
    pub auto_reconnect: AutoReconnectConfig,
}

/// One downstream server: either a stdio command or an HTTP/SSE URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Command to spawn (stdio transport)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for the command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment for the child process
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Endpoint URL (HTTP/SSE transport)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Per-request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Per-server reconnect policy (HTTP/SSE); falls back to `autoReconnect`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectConfig>,
    /// Authentication for this downstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

impl ServerConfig {
    /// Per-request timeout as a [`Duration`], when configured.
    #[must_use]
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

/// Backoff parameters, milliseconds on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum retry attempts
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Multiplier applied per subsequent attempt
    pub backoff_multiplier: f64,
    /// Upper bound on any delay, in milliseconds
    pub max_delay_ms: u64,
}

impl ReconnectConfig {
    /// Convert to the transport layer's policy type.
    #[must_use]
    pub fn to_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

/// Global automatic reconnection switch and default policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoReconnectConfig {
    /// When false, transport failures never schedule retries
    pub enabled: bool,
    /// Default backoff parameters
    #[serde(flatten)]
    pub policy: ReconnectConfig,
}

impl Default for AutoReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: ReconnectConfig::default(),
        }
    }
}

/// Authentication spec for one downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthConfig {
    /// No authentication
    None,
    /// Static bearer token
    #[serde(rename_all = "camelCase")]
    Bearer {
        /// The token; may be an environment reference
        token: String,
    },
    /// OAuth2 Client Credentials flow
    #[serde(rename_all = "camelCase")]
    Oauth2ClientCredentials {
        /// OAuth client id
        client_id: String,
        /// OAuth client secret
        client_secret: String,
        /// Token endpoint URL
        token_endpoint: String,
        /// Space-separated scope
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
        /// Expected token audience
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audience: Option<String>,
        /// Token store backend
        #[serde(default)]
        store: TokenStoreKind,
    },
    /// OAuth2 Authorization Code + PKCE flow
    #[serde(rename_all = "camelCase")]
    Oauth2AuthCode {
        /// OAuth client id
        client_id: String,
        /// Client secret; omitted for public clients
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        /// Authorization endpoint URL
        authorization_endpoint: String,
        /// Token endpoint URL
        token_endpoint: String,
        /// Redirect URI registered with the authorization server
        redirect_uri: String,
        /// Space-separated scope
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
        /// Expected token audience
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audience: Option<String>,
        /// Token store backend
        #[serde(default)]
        store: TokenStoreKind,
    },
}

/// Which token store backs an OAuth provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenStoreKind {
    /// In-memory, lost on restart
    #[default]
    Memory,
    /// OS keychain (or the user-only file fallback)
    Keychain,
}

impl ProxyConfig {
    /// Parse a configuration document and resolve environment references.
    pub fn load_str(raw: &str) -> ProxyResult<Self> {
        // Phase 1: strict schema
        let parsed: Self =
            serde_json::from_str(raw).map_err(|e| ProxyError::Config(e.to_string()))?;
        // Phase 2: env substitution over every string field
        let substituted = resolve_env_refs(
            serde_json::to_value(&parsed).map_err(|e| ProxyError::Config(e.to_string()))?,
        )?;
        let config: Self =
            serde_json::from_value(substituted).map_err(|e| ProxyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ProxyResult<()> {
        for (name, server) in &self.servers {
            match (&server.command, &server.url) {
                (Some(_), Some(_)) => {
                    return Err(ProxyError::Config(format!(
                        "server '{name}' must set either command or url, not both"
                    )));
                }
                (None, None) => {
                    return Err(ProxyError::Config(format!(
                        "server '{name}' must set command or url"
                    )));
                }
                _ => {}
            }
            if server.timeout == Some(0) {
                return Err(ProxyError::Config(format!(
                    "server '{name}' timeout must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Walk a JSON value and expand environment references in every string.
fn resolve_env_refs(value: Value) -> ProxyResult<Value> {
    Ok(match value {
        Value::String(s) if envsubst::has_refs(&s) => Value::String(envsubst::expand(&s)?),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(resolve_env_refs).collect::<ProxyResult<_>>()?)
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| resolve_env_refs(v).map(|v| (k, v)))
                .collect::<ProxyResult<_>>()?,
        ),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "servers": {
            "memory": {
                "command": "npx",
                "args": ["-y", "@modelcontextprotocol/server-memory"],
                "env": {"LOG_LEVEL": "debug"}
            },
            "search": {
                "url": "https://mcp.example.com/sse",
                "timeout": 15000,
                "reconnect": {
                    "max_attempts": 3,
                    "initial_delay_ms": 500,
                    "backoff_multiplier": 3.0,
                    "max_delay_ms": 2000
                },
                "auth": {
                    "type": "oauth2ClientCredentials",
                    "clientId": "svc",
                    "clientSecret": "${CC_SECRET:fallback}",
                    "tokenEndpoint": "https://auth.example.com/token",
                    "scope": "api:read"
                }
            }
        },
        "toolOverrides": {
            "memory__*": {"description": "namespaced memory tool"}
        },
        "overrideSettings": {"applyToDynamic": true, "validateOverrides": true},
        "autoReconnect": {
            "enabled": true,
            "max_attempts": 5,
            "initial_delay_ms": 1000,
            "backoff_multiplier": 2.0,
            "max_delay_ms": 30000
        }
    }"#;

    #[test]
    fn test_load_full_document() {
        let config = ProxyConfig::load_str(SAMPLE).unwrap();
        assert_eq!(config.servers.len(), 2);

        let memory = &config.servers["memory"];
        assert_eq!(memory.command.as_deref(), Some("npx"));
        assert_eq!(memory.args.len(), 2);

        let search = &config.servers["search"];
        assert_eq!(search.timeout_duration(), Some(Duration::from_millis(15000)));
        let policy = search.reconnect.as_ref().unwrap().to_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));

        match search.auth.as_ref().unwrap() {
            AuthConfig::Oauth2ClientCredentials { client_secret, store, .. } => {
                // unset env var fell back to the reference default
                assert_eq!(client_secret, "fallback");
                assert_eq!(*store, TokenStoreKind::Memory);
            }
            other => panic!("unexpected auth config: {other:?}"),
        }

        assert!(config.tool_overrides.contains_key("memory__*"));
        assert!(config.override_settings.apply_to_dynamic);
        assert!(config.auto_reconnect.enabled);
    }

    #[test]
    fn test_unresolved_env_fails_at_startup() {
        let raw = r#"{"servers": {"s": {"command": "${MANIFOLD_UNSET_BINARY}"}}}"#;
        let err = ProxyConfig::load_str(raw).unwrap_err();
        assert!(err.to_string().contains("MANIFOLD_UNSET_BINARY"));
    }

    #[test]
    fn test_server_needs_exactly_one_transport() {
        let both = r#"{"servers": {"s": {"command": "x", "url": "https://y"}}}"#;
        assert!(ProxyConfig::load_str(both).is_err());

        let neither = r#"{"servers": {"s": {}}}"#;
        assert!(ProxyConfig::load_str(neither).is_err());
    }

    #[test]
    fn test_bearer_auth_shape() {
        let raw = r#"{"servers": {"s": {"url": "https://y", "auth": {"type": "bearer", "token": "tok"}}}}"#;
        let config = ProxyConfig::load_str(raw).unwrap();
        assert!(matches!(
            config.servers["s"].auth.as_ref().unwrap(),
            AuthConfig::Bearer { token } if token == "tok"
        ));
    }

    #[test]
    fn test_defaults_apply() {
        let raw = r#"{"servers": {"s": {"command": "x"}}}"#;
        let config = ProxyConfig::load_str(raw).unwrap();
        assert!(config.auto_reconnect.enabled);
        assert!(config.tool_overrides.is_empty());
        assert!(!config.override_settings.apply_to_dynamic);
    }
}
