//! Authentication for the Manifold proxy.
//!
//! Pluggable providers behind one trait: OAuth2 Client Credentials and
//! Authorization Code + PKCE sharing a base with single-flight refresh and
//! proactive refresh scheduling, plus static Bearer and no-auth variants.
//! Tokens live in an in-memory store or the OS keychain.

pub mod error;
pub mod oauth2;
pub mod provider;
pub mod store;
pub mod types;

pub use error::{AuthError, AuthResult, OAuthErrorKind};
pub use oauth2::{
    AuthCodeConfig, AuthCodeFlow, AuthCodeProvider, ClientCredentialsConfig,
    ClientCredentialsFlow, ClientCredentialsProvider, FlowRegistry, OAuth2Provider, TokenFlow,
};
pub use provider::{AuthProvider, BearerAuthProvider, NoAuthProvider, ProviderHeaderSource};
pub use store::{KeychainTokenStore, MemoryTokenStore, RefreshCallback, TokenStore};
pub use types::{TokenData, TokenResponse, process_token_response};
