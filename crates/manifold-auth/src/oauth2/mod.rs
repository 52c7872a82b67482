//! OAuth2 flows.
//!
//! A shared base provider owns the token store, single-flight refresh, and
//! proactive refresh scheduling; concrete flows implement [`TokenFlow`] to
//! say how a token is actually acquired: Client Credentials (RFC 6749 §4.4)
//! for server-to-server, Authorization Code with PKCE (RFC 6749 §4.1,
//! RFC 7636) for interactive consent.

mod auth_code;
mod base;
mod client_credentials;
mod http;

pub use auth_code::{AuthCodeConfig, AuthCodeFlow, AuthCodeProvider, FlowRegistry};
pub use base::{OAuth2Provider, TokenFlow};
pub use client_credentials::{
    ClientCredentialsConfig, ClientCredentialsFlow, ClientCredentialsProvider,
};
pub use http::{post_token_request, request_with_retry};
