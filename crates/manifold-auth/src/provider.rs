//! The provider contract plus the non-OAuth providers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use manifold_core::envsubst;
use manifold_transport::{AuthHeaders, TransportError, TransportResult};

use crate::error::{AuthError, AuthResult};

/// Produces authorization headers on demand.
#[async_trait]
pub trait AuthProvider: Send + Sync + std::fmt::Debug {
    /// Headers for the next outgoing request. OAuth providers ensure a
    /// valid token first; static providers answer immediately.
    async fn get_headers(&self) -> AuthResult<HashMap<String, String>>;
}

/// Provider for downstreams that require no authentication.
#[derive(Debug, Clone, Default)]
pub struct NoAuthProvider;

#[async_trait]
impl AuthProvider for NoAuthProvider {
    async fn get_headers(&self) -> AuthResult<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// Provider carrying a static bearer token.
#[derive(Clone)]
pub struct BearerAuthProvider {
    token: SecretString,
}

impl std::fmt::Debug for BearerAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerAuthProvider").field("token", &"<secret>").finish()
    }
}

impl BearerAuthProvider {
    /// Create a provider from a raw token value; `${NAME}` references are
    /// resolved at construction.
    pub fn new(token: &str) -> AuthResult<Self> {
        let token = envsubst::expand(token)?;
        if token.trim().is_empty() {
            return Err(AuthError::Config("bearer token must not be empty".to_string()));
        }
        Ok(Self {
            token: SecretString::new(token.trim().to_string()),
        })
    }
}

#[async_trait]
impl AuthProvider for BearerAuthProvider {
    async fn get_headers(&self) -> AuthResult<HashMap<String, String>> {
        let mut headers = HashMap::with_capacity(1);
        headers.insert(
            "Authorization".to_string(),
            format!("Bearer {}", self.token.expose_secret()),
        );
        Ok(headers)
    }
}

/// Adapter exposing any [`AuthProvider`] as the transport layer's
/// [`AuthHeaders`] source.
#[derive(Debug, Clone)]
pub struct ProviderHeaderSource(pub Arc<dyn AuthProvider>);

#[async_trait]
impl AuthHeaders for ProviderHeaderSource {
    async fn auth_headers(&self) -> TransportResult<HashMap<String, String>> {
        self.0
            .get_headers()
            .await
            .map_err(|e| TransportError::AuthenticationFailed(e.to_string()))
    }
}
