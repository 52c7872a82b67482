//! Client Credentials flow (RFC 6749 §4.4).

use async_trait::async_trait;
use secrecy::SecretString;
use url::Url;

use manifold_core::{envsubst, generate_request_id};

use crate::error::{AuthError, AuthResult};
use crate::oauth2::base::{OAuth2Provider, TokenFlow};
use crate::oauth2::http::{post_token_request, request_with_retry};
use crate::types::{TokenData, process_token_response};

/// Raw Client Credentials configuration. Any field may carry `${NAME}` /
/// `${NAME:default}` environment references; they are resolved at
/// construction and a missing required variable fails construction.
#[derive(Debug, Clone)]
pub struct ClientCredentialsConfig {
    /// OAuth client identifier
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Token endpoint URL
    pub token_endpoint: String,
    /// Space-separated scope
    pub scope: Option<String>,
    /// Expected token audience; validated on every response when set
    pub audience: Option<String>,
}

/// Client Credentials token flow.
pub struct ClientCredentialsFlow {
    client_id: String,
    client_secret: SecretString,
    token_endpoint: Url,
    scope: Option<String>,
    audience: Option<String>,
    http: reqwest::Client,
}

impl std::fmt::Debug for ClientCredentialsFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialsFlow")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<secret>")
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("scope", &self.scope)
            .field("audience", &self.audience)
            .finish()
    }
}

impl ClientCredentialsFlow {
    /// Build the flow, resolving environment references and validating the
    /// endpoint URL.
    pub fn from_config(config: &ClientCredentialsConfig) -> AuthResult<Self> {
        let client_id = envsubst::expand(&config.client_id)?;
        let client_secret = envsubst::expand(&config.client_secret)?;
        let token_endpoint = envsubst::expand(&config.token_endpoint)?;

        if client_id.is_empty() {
            return Err(AuthError::Config("clientId must not be empty".to_string()));
        }
        if client_secret.is_empty() {
            return Err(AuthError::Config("clientSecret must not be empty".to_string()));
        }
        let token_endpoint = Url::parse(&token_endpoint)
            .map_err(|e| AuthError::Config(format!("invalid tokenEndpoint: {e}")))?;

        let scope = config.scope.as_deref().map(envsubst::expand).transpose()?;
        let audience = config.audience.as_deref().map(envsubst::expand).transpose()?;

        Ok(Self {
            client_id,
            client_secret: SecretString::new(client_secret),
            token_endpoint,
            scope,
            audience,
            http: reqwest::Client::builder()
                .build()
                .expect("failed to build HTTP client"),
        })
    }
}

#[async_trait]
impl TokenFlow for ClientCredentialsFlow {
    async fn acquire_token(&self) -> AuthResult<TokenData> {
        // One id for the logical request, stable across retries.
        let request_id = generate_request_id();

        let mut form: Vec<(&str, String)> =
            vec![("grant_type", "client_credentials".to_string())];
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.clone()));
        }
        if let Some(audience) = &self.audience {
            form.push(("audience", audience.clone()));
        }

        let response = request_with_retry(|_attempt| {
            post_token_request(
                &self.http,
                &self.token_endpoint,
                &form,
                Some((&self.client_id, &self.client_secret)),
                Some(&request_id),
            )
        })
        .await?;

        process_token_response(response, self.audience.as_deref())
    }
}

/// A Client Credentials flow behind the shared provider base.
pub type ClientCredentialsProvider = OAuth2Provider<ClientCredentialsFlow>;
