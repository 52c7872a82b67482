//! Authorization Code flow with PKCE (RFC 6749 §4.1, RFC 7636).
//!
//! Starting a flow mints a random `state` and PKCE verifier, records the
//! pending flow in the provider's own map *and* in a process-wide
//! [`FlowRegistry`] so the HTTP callback handler can route
//! `complete_flow(state, code)` to the right provider in O(1). Flows time
//! out after five minutes; a periodic sweeper additionally clears anything
//! older than ten, so an abandoned browser tab can never pin memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use manifold_core::envsubst;

use crate::error::{AuthError, AuthResult};
use crate::oauth2::base::{OAuth2Provider, TokenFlow};
use crate::oauth2::http::{post_token_request, request_with_retry};
use crate::types::{TokenData, process_token_response};

/// How long a started flow waits for its callback.
pub const FLOW_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Interval of the expiry sweeper.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// Age past which the sweeper rejects a pending flow.
pub const SWEEP_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Raw Authorization Code configuration. Fields may carry environment
/// references, resolved at construction.
#[derive(Debug, Clone)]
pub struct AuthCodeConfig {
    /// OAuth client identifier
    pub client_id: String,
    /// Client secret; omitted for public clients
    pub client_secret: Option<String>,
    /// Authorization endpoint the user is sent to
    pub authorization_endpoint: String,
    /// Token endpoint for the code exchange
    pub token_endpoint: String,
    /// Redirect URI registered with the authorization server
    pub redirect_uri: String,
    /// Space-separated scope
    pub scope: Option<String>,
    /// Expected token audience
    pub audience: Option<String>,
}

struct PendingFlow {
    code_verifier: String,
    created_at: Instant,
    resolver: oneshot::Sender<AuthResult<TokenData>>,
    deadline: JoinHandle<()>,
}

/// Process-wide `state → provider` routing table for OAuth callbacks.
///
/// Owned by the application and passed to every provider at construction;
/// providers register their pending states with weak references so a
/// dropped provider cannot be resurrected through the registry.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    states: DashMap<String, Weak<AuthCodeInner>>,
}

impl FlowRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Look up the provider that minted `state`. Returns `None` once the
    /// flow completed, expired, or its provider was dropped.
    #[must_use]
    pub fn provider_for_state(&self, state: &str) -> Option<AuthCodeFlow> {
        self.states
            .get(state)
            .and_then(|entry| entry.value().upgrade())
            .map(|inner| AuthCodeFlow { inner })
    }

    /// Number of registered states, for diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no states are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

struct AuthCodeInner {
    client_id: String,
    client_secret: Option<SecretString>,
    authorization_endpoint: Url,
    token_endpoint: Url,
    redirect_uri: String,
    scope: Option<String>,
    audience: Option<String>,
    http: reqwest::Client,
    registry: Arc<FlowRegistry>,
    pending: StdMutex<HashMap<String, PendingFlow>>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for AuthCodeInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().expect("sweeper mutex poisoned").take() {
            sweeper.abort();
        }
        let drained: Vec<(String, PendingFlow)> = self
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .drain()
            .collect();
        for (state, flow) in drained {
            self.registry.states.remove(&state);
            flow.deadline.abort();
            let _ = flow.resolver.send(Err(AuthError::InvalidFlowState));
        }
    }
}

/// Authorization Code + PKCE token flow.
#[derive(Clone)]
pub struct AuthCodeFlow {
    inner: Arc<AuthCodeInner>,
}

impl std::fmt::Debug for AuthCodeFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCodeFlow")
            .field("client_id", &self.inner.client_id)
            .field("authorization_endpoint", &self.inner.authorization_endpoint.as_str())
            .field("pending_flows", &self.pending_count())
            .finish()
    }
}

fn random_state() -> String {
    // 128 bits of entropy, hex-encoded
    format!("{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..))
}

fn random_code_verifier() -> String {
    // 256 bits of entropy, base64url without padding (RFC 7636 §4.1)
    let bytes: [u8; 32] = std::array::from_fn(|_| fastrand::u8(..));
    URL_SAFE_NO_PAD.encode(bytes)
}

fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

impl AuthCodeFlow {
    /// Build the flow, resolving environment references, validating both
    /// endpoint URLs, and starting the expiry sweeper.
    pub fn from_config(config: &AuthCodeConfig, registry: Arc<FlowRegistry>) -> AuthResult<Self> {
        let client_id = envsubst::expand(&config.client_id)?;
        if client_id.is_empty() {
            return Err(AuthError::Config("clientId must not be empty".to_string()));
        }
        let client_secret = config
            .client_secret
            .as_deref()
            .map(envsubst::expand)
            .transpose()?
            .filter(|secret| !secret.is_empty())
            .map(SecretString::new);

        let authorization_endpoint = Url::parse(&envsubst::expand(&config.authorization_endpoint)?)
            .map_err(|e| AuthError::Config(format!("invalid authorizationEndpoint: {e}")))?;
        let token_endpoint = Url::parse(&envsubst::expand(&config.token_endpoint)?)
            .map_err(|e| AuthError::Config(format!("invalid tokenEndpoint: {e}")))?;
        let redirect_uri = envsubst::expand(&config.redirect_uri)?;
        let scope = config.scope.as_deref().map(envsubst::expand).transpose()?;
        let audience = config.audience.as_deref().map(envsubst::expand).transpose()?;

        let inner = Arc::new(AuthCodeInner {
            client_id,
            client_secret,
            authorization_endpoint,
            token_endpoint,
            redirect_uri,
            scope,
            audience,
            http: reqwest::Client::builder()
                .build()
                .expect("failed to build HTTP client"),
            registry,
            pending: StdMutex::new(HashMap::new()),
            sweeper: StdMutex::new(None),
        });

        // Sweeper holds only a weak handle so the provider can be dropped.
        let weak = Arc::downgrade(&inner);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                sweep_expired(&inner, SWEEP_THRESHOLD);
            }
        });
        *inner.sweeper.lock().expect("sweeper mutex poisoned") = Some(sweeper);

        Ok(Self { inner })
    }

    /// Number of flows currently awaiting their callback.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending mutex poisoned").len()
    }

    /// Start a flow: mint state + PKCE material, register the pending
    /// entry, and return the authorization URL together with the receiver
    /// that resolves when the callback (or a timeout) settles the flow.
    pub fn start_flow(&self) -> (String, oneshot::Receiver<AuthResult<TokenData>>) {
        let state = random_state();
        let code_verifier = random_code_verifier();
        let challenge = code_challenge(&code_verifier);

        let mut auth_url = self.inner.authorization_endpoint.clone();
        {
            let mut query = auth_url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.inner.client_id)
                .append_pair("redirect_uri", &self.inner.redirect_uri)
                .append_pair("state", &state)
                .append_pair("code_challenge", &challenge)
                .append_pair("code_challenge_method", "S256");
            if let Some(scope) = &self.inner.scope {
                query.append_pair("scope", scope);
            }
            if let Some(audience) = &self.inner.audience {
                query.append_pair("audience", audience);
            }
        }

        let (resolver, receiver) = oneshot::channel();

        let weak = Arc::downgrade(&self.inner);
        let deadline_state = state.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(FLOW_TIMEOUT).await;
            let Some(inner) = weak.upgrade() else { return };
            let removed = inner
                .pending
                .lock()
                .expect("pending mutex poisoned")
                .remove(&deadline_state);
            if let Some(flow) = removed {
                inner.registry.states.remove(&deadline_state);
                debug!(state = %deadline_state, "authorization flow timed out");
                let _ = flow.resolver.send(Err(AuthError::FlowTimeout));
            }
        });

        self.inner.pending.lock().expect("pending mutex poisoned").insert(
            state.clone(),
            PendingFlow {
                code_verifier,
                created_at: Instant::now(),
                resolver,
                deadline,
            },
        );
        self.inner
            .registry
            .states
            .insert(state.clone(), Arc::downgrade(&self.inner));

        // The URL carries only the challenge, never the verifier.
        info!(url = %auth_url, "authorization required; open this URL to continue");

        (state, receiver)
    }

    /// Complete a flow from the OAuth callback: exchange the code, settle
    /// the pending receiver, and clean up both maps regardless of outcome.
    pub async fn complete_flow(&self, state: &str, code: &str) -> AuthResult<TokenData> {
        let pending = self
            .inner
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(state);
        self.inner.registry.states.remove(state);

        let Some(pending) = pending else {
            return Err(AuthError::InvalidFlowState);
        };
        pending.deadline.abort();

        let form: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.inner.redirect_uri.clone()),
            ("client_id", self.inner.client_id.clone()),
            ("code_verifier", pending.code_verifier.clone()),
        ];

        let basic = self
            .inner
            .client_secret
            .as_ref()
            .map(|secret| (self.inner.client_id.as_str(), secret));

        let result = request_with_retry(|_attempt| {
            post_token_request(&self.inner.http, &self.inner.token_endpoint, &form, basic, None)
        })
        .await
        .and_then(|response| process_token_response(response, self.inner.audience.as_deref()));

        let _ = pending.resolver.send(result.clone());
        result
    }

    /// Sweep flows older than [`SWEEP_THRESHOLD`] immediately. The ticker
    /// calls this every [`SWEEP_INTERVAL`]; exposed for direct use.
    pub fn sweep_now(&self) {
        sweep_expired(&self.inner, SWEEP_THRESHOLD);
    }

    #[cfg(test)]
    fn sweep_older_than(&self, age: Duration) {
        sweep_expired(&self.inner, age);
    }
}

fn sweep_expired(inner: &Arc<AuthCodeInner>, threshold: Duration) {
    let expired: Vec<(String, PendingFlow)> = {
        let mut pending = inner.pending.lock().expect("pending mutex poisoned");
        let states: Vec<String> = pending
            .iter()
            .filter(|(_, flow)| flow.created_at.elapsed() >= threshold)
            .map(|(state, _)| state.clone())
            .collect();
        states
            .into_iter()
            .filter_map(|state| pending.remove(&state).map(|flow| (state, flow)))
            .collect()
    };

    for (state, flow) in expired {
        warn!(state = %state, "sweeping expired authorization flow");
        inner.registry.states.remove(&state);
        flow.deadline.abort();
        let _ = flow.resolver.send(Err(AuthError::InvalidFlowState));
    }
}

#[async_trait]
impl TokenFlow for AuthCodeFlow {
    async fn acquire_token(&self) -> AuthResult<TokenData> {
        let (_state, receiver) = self.start_flow();
        receiver.await.unwrap_or(Err(AuthError::InvalidFlowState))
    }
}

/// An Authorization Code flow behind the shared provider base.
pub type AuthCodeProvider = OAuth2Provider<AuthCodeFlow>;

impl OAuth2Provider<AuthCodeFlow> {
    /// Route an OAuth callback into the underlying flow.
    pub async fn complete_flow(&self, state: &str, code: &str) -> AuthResult<TokenData> {
        self.flow().complete_flow(state, code).await
    }
}
