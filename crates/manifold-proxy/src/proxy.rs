//! The proxy core.
//!
//! Aggregates tool catalogs from every connected downstream, exposes them
//! under namespaced names with overrides applied, and dispatches calls back
//! through the routing table. Per-server catalogs are cached and dropped on
//! any status change or override mutation; the routing table is rebuilt on
//! every refresh and swapped atomically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use arc_swap::ArcSwap;
use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use manifold_auth::{
    AuthCodeFlow, AuthCodeProvider, AuthProvider, BearerAuthProvider, ClientCredentialsFlow,
    ClientCredentialsProvider, FlowRegistry, KeychainTokenStore, MemoryTokenStore,
    ProviderHeaderSource, TokenStore,
};
use manifold_core::{Tool, namespaced_name, redact_secrets};
use manifold_transport::{
    AuthHeaders, HttpSseConfig, HttpSseTransport, StdioConfig, StdioTransport, Transport,
};

use crate::config::{AuthConfig, ProxyConfig, ServerConfig, TokenStoreKind};
use crate::connection::ConnectionManager;
use crate::error::{ProxyError, ProxyResult};
use crate::events::{ConnectionStatus, EventBus, ProxyEvent};
use crate::overrides::DynamicOverrides;

/// Where an exposed tool routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Downstream server name
    pub server: String,
    /// The tool's original, pre-override name
    pub original_name: String,
}

struct ProxyInner {
    servers: HashMap<String, ConnectionManager>,
    overrides: Arc<DynamicOverrides>,
    bus: EventBus,
    routing: ArcSwap<HashMap<String, RouteEntry>>,
    /// Original (pre-namespace, pre-override) catalogs per server
    catalogs: StdMutex<HashMap<String, Vec<Tool>>>,
}

/// The aggregating proxy.
#[derive(Clone)]
pub struct McpProxy {
    inner: Arc<ProxyInner>,
}

impl std::fmt::Debug for McpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpProxy")
            .field("servers", &self.inner.servers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl McpProxy {
    /// Assemble a proxy from pre-built connection managers.
    #[must_use]
    pub fn new(
        managers: Vec<ConnectionManager>,
        overrides: DynamicOverrides,
        bus: EventBus,
    ) -> Self {
        let servers = managers
            .into_iter()
            .map(|manager| (manager.name().to_string(), manager))
            .collect();
        let inner = Arc::new(ProxyInner {
            servers,
            overrides: Arc::new(overrides),
            bus,
            routing: ArcSwap::from_pointee(HashMap::new()),
            catalogs: StdMutex::new(HashMap::new()),
        });

        // Override mutations invalidate caches and notify the upstream.
        {
            let weak: Weak<ProxyInner> = Arc::downgrade(&inner);
            inner.overrides.set_change_hook(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.catalogs.lock().expect("catalog mutex poisoned").clear();
                    inner.bus.emit_tool_list_changed();
                }
            }));
        }

        // Status transitions invalidate the affected server's catalog.
        {
            let weak: Weak<ProxyInner> = Arc::downgrade(&inner);
            let mut events = inner.bus.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(ProxyEvent::Status(event)) => {
                            let Some(inner) = weak.upgrade() else { break };
                            inner
                                .catalogs
                                .lock()
                                .expect("catalog mutex poisoned")
                                .remove(&event.server);
                        }
                        Ok(ProxyEvent::ToolListChanged) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        Self { inner }
    }

    /// Build a proxy from configuration: transports, auth providers, and
    /// one connection manager per server.
    pub async fn from_config(
        config: &ProxyConfig,
        registry: Arc<FlowRegistry>,
    ) -> ProxyResult<Self> {
        let bus = EventBus::new();
        let mut managers = Vec::with_capacity(config.servers.len());

        for (name, server) in &config.servers {
            let auth = build_auth_provider(name, server.auth.as_ref(), &registry).await?;
            let transport = build_transport(name, server, config, auth)?;
            let policy = server
                .reconnect
                .as_ref()
                .unwrap_or(&config.auto_reconnect.policy)
                .to_policy();
            managers.push(ConnectionManager::new(
                name,
                transport,
                policy,
                config.auto_reconnect.enabled,
                bus.clone(),
                server.timeout_duration(),
            ));
        }

        let overrides = DynamicOverrides::new(
            config.tool_overrides.clone(),
            config.override_settings,
        );
        Ok(Self::new(managers, overrides, bus))
    }

    /// The dynamic override facade.
    #[must_use]
    pub fn overrides(&self) -> &Arc<DynamicOverrides> {
        &self.inner.overrides
    }

    /// Subscribe to status and tool-list events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProxyEvent> {
        self.inner.bus.subscribe()
    }

    /// Connect every configured server. Individual failures are reported
    /// by status events (and retried per policy); construction never fails
    /// because one downstream is down.
    pub async fn connect_all(&self) {
        let starts = self
            .inner
            .servers
            .values()
            .map(|manager| async move {
                if let Err(e) = manager.start().await {
                    warn!(server = %manager.name(), "initial connection failed: {e}");
                }
            })
            .collect::<Vec<_>>();
        join_all(starts).await;
    }

    /// Latest status for a server; unknown names read as disconnected.
    #[must_use]
    pub fn status(&self, server: &str) -> ConnectionStatus {
        self.inner
            .servers
            .get(server)
            .map_or(ConnectionStatus::Disconnected, ConnectionManager::status)
    }

    /// Manually reconnect one server.
    pub async fn reconnect(&self, server: &str) -> ProxyResult<()> {
        self.manager(server)?.reconnect().await
    }

    /// Manually disconnect one server.
    pub async fn disconnect(&self, server: &str) -> ProxyResult<()> {
        self.manager(server)?.disconnect().await
    }

    fn manager(&self, server: &str) -> ProxyResult<&ConnectionManager> {
        self.inner
            .servers
            .get(server)
            .ok_or_else(|| ProxyError::UnknownServer(server.to_string()))
    }

    /// Aggregate the exposed catalog: every connected server's tools,
    /// namespaced and with overrides applied. Disconnected servers
    /// contribute nothing; the call itself never fails because of them.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let engine = self.inner.overrides.engine();
        let mut exposed: Vec<Tool> = Vec::new();
        let mut routing: HashMap<String, RouteEntry> = HashMap::new();

        for (server, manager) in &self.inner.servers {
            if !manager.status().is_connected() {
                continue;
            }
            let tools = match self.server_catalog(server, manager).await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server = %server, "catalog fetch failed: {e}");
                    continue;
                }
            };

            for tool in tools {
                let namespaced = namespaced_name(server, &tool.name);
                let rewritten = engine.apply(&tool, &namespaced);

                if routing.contains_key(&rewritten.name) {
                    warn!(
                        name = %rewritten.name,
                        server = %server,
                        "namespaced tool name collision, keeping first-seen"
                    );
                    continue;
                }
                routing.insert(
                    rewritten.name.clone(),
                    RouteEntry {
                        server: server.clone(),
                        original_name: tool.name.clone(),
                    },
                );
                exposed.push(rewritten);
            }
        }

        self.inner.routing.store(Arc::new(routing));
        exposed
    }

    async fn server_catalog(
        &self,
        server: &str,
        manager: &ConnectionManager,
    ) -> ProxyResult<Vec<Tool>> {
        let cached = self
            .inner
            .catalogs
            .lock()
            .expect("catalog mutex poisoned")
            .get(server)
            .cloned();
        if let Some(tools) = cached {
            return Ok(tools);
        }

        let result = manager
            .request(json!({"jsonrpc": "2.0", "method": "tools/list"}), None)
            .await?;
        let tools: Vec<Tool> = serde_json::from_value(
            result.get("tools").cloned().unwrap_or_else(|| json!([])),
        )
        .map_err(|e| ProxyError::Config(format!("malformed tools/list from '{server}': {e}")))?;

        debug!(server = %server, count = tools.len(), "catalog fetched");
        self.inner
            .catalogs
            .lock()
            .expect("catalog mutex poisoned")
            .insert(server.to_string(), tools.clone());
        Ok(tools)
    }

    /// Dispatch a call by exposed name: split off the route, forward the
    /// original tool name with untouched arguments, and return the
    /// downstream result verbatim.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ProxyResult<Value> {
        let route = self
            .inner
            .routing
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::ToolNotFound(name.to_string()))?;

        let manager = self.manager(&route.server)?;
        let result = manager
            .request(
                json!({
                    "jsonrpc": "2.0",
                    "method": "tools/call",
                    "params": {"name": route.original_name, "arguments": arguments}
                }),
                None,
            )
            .await;

        match result {
            Ok(value) => Ok(value),
            // JSON-RPC errors pass through verbatim; anything else is
            // sanitized so a failure can never leak credentials upstream.
            Err(ProxyError::Transport(manifold_transport::TransportError::JsonRpc {
                code,
                message,
            })) => Err(ProxyError::Transport(
                manifold_transport::TransportError::JsonRpc {
                    code,
                    message: redact_secrets(&message),
                },
            )),
            Err(other) => Err(other),
        }
    }

    /// Shut every connection down and terminate.
    pub async fn shutdown(&self) {
        info!("shutting down proxy");
        let shutdowns = self
            .inner
            .servers
            .values()
            .map(ConnectionManager::shutdown)
            .collect::<Vec<_>>();
        join_all(shutdowns).await;
    }
}

fn build_transport(
    name: &str,
    server: &ServerConfig,
    config: &ProxyConfig,
    auth: Option<Arc<dyn AuthHeaders>>,
) -> ProxyResult<Arc<dyn Transport>> {
    if let Some(command) = &server.command {
        if auth.is_some() {
            warn!(server = %name, "auth configuration ignored for stdio transport");
        }
        let mut stdio = StdioConfig {
            command: command.clone(),
            args: server.args.clone(),
            env: server.env.clone(),
            ..Default::default()
        };
        if let Some(timeout) = server.timeout_duration() {
            stdio.request_timeout = timeout;
        }
        return Ok(Arc::new(StdioTransport::new(stdio)));
    }

    let url = server
        .url
        .clone()
        .ok_or_else(|| ProxyError::Config(format!("server '{name}' has no transport")))?;
    let mut http = HttpSseConfig {
        url,
        reconnect: server
            .reconnect
            .as_ref()
            .unwrap_or(&config.auto_reconnect.policy)
            .to_policy(),
        ..Default::default()
    };
    if !config.auto_reconnect.enabled {
        // a zero budget makes the transport's scheduler report exhaustion
        // on the first stream break instead of retrying
        http.reconnect.max_attempts = 0;
    }
    if let Some(timeout) = server.timeout_duration() {
        http.request_timeout = timeout;
    }
    Ok(Arc::new(HttpSseTransport::with_auth(http, auth)))
}

async fn build_auth_provider(
    server: &str,
    auth: Option<&AuthConfig>,
    registry: &Arc<FlowRegistry>,
) -> ProxyResult<Option<Arc<dyn AuthHeaders>>> {
    let provider: Arc<dyn AuthProvider> = match auth {
        None | Some(AuthConfig::None) => return Ok(None),
        Some(AuthConfig::Bearer { token }) => Arc::new(BearerAuthProvider::new(token)?),
        Some(AuthConfig::Oauth2ClientCredentials {
            client_id,
            client_secret,
            token_endpoint,
            scope,
            audience,
            store,
        }) => {
            let flow = ClientCredentialsFlow::from_config(
                &manifold_auth::ClientCredentialsConfig {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    token_endpoint: token_endpoint.clone(),
                    scope: scope.clone(),
                    audience: audience.clone(),
                },
            )?;
            Arc::new(ClientCredentialsProvider::new(flow, build_store(server, *store)?).await)
        }
        Some(AuthConfig::Oauth2AuthCode {
            client_id,
            client_secret,
            authorization_endpoint,
            token_endpoint,
            redirect_uri,
            scope,
            audience,
            store,
        }) => {
            let flow = AuthCodeFlow::from_config(
                &manifold_auth::AuthCodeConfig {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    authorization_endpoint: authorization_endpoint.clone(),
                    token_endpoint: token_endpoint.clone(),
                    redirect_uri: redirect_uri.clone(),
                    scope: scope.clone(),
                    audience: audience.clone(),
                },
                Arc::clone(registry),
            )?;
            Arc::new(AuthCodeProvider::new(flow, build_store(server, *store)?).await)
        }
    };
    Ok(Some(Arc::new(ProviderHeaderSource(provider))))
}

fn build_store(server: &str, kind: TokenStoreKind) -> ProxyResult<Arc<dyn TokenStore>> {
    Ok(match kind {
        TokenStoreKind::Memory => Arc::new(MemoryTokenStore::new()),
        TokenStoreKind::Keychain => Arc::new(KeychainTokenStore::new(server)?),
    })
}
