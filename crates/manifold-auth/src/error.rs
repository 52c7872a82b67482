//! Authentication error taxonomy.
//!
//! OAuth failures are discriminated by their RFC 6749 error code so callers
//! can decide retry behavior: network failures and HTTP 5xx responses are
//! transient, everything else propagates immediately.

use thiserror::Error;

/// A specialized `Result` type for authentication operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// RFC 6749 §5.2 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorKind {
    /// `invalid_client`
    InvalidClient,
    /// `invalid_grant`
    InvalidGrant,
    /// `invalid_scope`
    InvalidScope,
    /// `unsupported_grant_type`
    UnsupportedGrantType,
    /// `access_denied`
    AccessDenied,
    /// `server_error`
    ServerError,
    /// `invalid_request`
    InvalidRequest,
    /// Anything the server returned outside the RFC vocabulary
    Unknown,
}

impl OAuthErrorKind {
    /// Map an error-code string from a token response body.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "invalid_client" => Self::InvalidClient,
            "invalid_grant" => Self::InvalidGrant,
            "invalid_scope" => Self::InvalidScope,
            "unsupported_grant_type" => Self::UnsupportedGrantType,
            "access_denied" => Self::AccessDenied,
            "server_error" => Self::ServerError,
            "invalid_request" => Self::InvalidRequest,
            _ => Self::Unknown,
        }
    }

    /// The wire-format code string.
    #[must_use]
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidScope => "invalid_scope",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::AccessDenied => "access_denied",
            Self::ServerError => "server_error",
            Self::InvalidRequest => "invalid_request",
            Self::Unknown => "unknown",
        }
    }
}

/// Errors surfaced by auth providers and token stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    /// The authorization server rejected the request with an RFC 6749 code.
    #[error("OAuth2 error ({}): {description}", kind.as_code())]
    OAuth {
        /// Discriminated error kind
        kind: OAuthErrorKind,
        /// Human-readable description from `error_description`, or the code
        description: String,
    },

    /// The token's audience does not match the configured expectation.
    /// Surfaced with the `invalid_grant` code.
    #[error("OAuth2 error (invalid_grant): audience mismatch: expected '{expected}', got '{actual}'")]
    AudienceMismatch {
        /// Configured audience
        expected: String,
        /// Audience returned by the server
        actual: String,
    },

    /// A network-level failure reaching the token endpoint. Transient.
    #[error("Network error: {0}")]
    Network(String),

    /// The token endpoint answered 5xx. Transient.
    #[error("Token endpoint returned HTTP {0}")]
    ServerStatus(u16),

    /// The token response body was not valid JSON or lacked `access_token`.
    #[error("Failed to parse OAuth2 token response")]
    TokenParse,

    /// No token could be produced after a refresh completed.
    #[error("Failed to acquire token")]
    TokenAcquisition,

    /// A callback arrived for a state the provider does not know (never
    /// started, already completed, or swept).
    #[error("Invalid or expired OAuth state")]
    InvalidFlowState,

    /// The interactive authorization flow hit its deadline.
    #[error("OAuth authorization flow timed out")]
    FlowTimeout,

    /// Token storage failed. Non-fatal for acquisition paths: the token is
    /// still handed to the caller and the failure is logged.
    #[error("Token storage error: {0}")]
    Storage(String),

    /// Invalid provider configuration, including unresolved environment
    /// references. Fatal at construction.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Whether a retry may succeed: network errors and HTTP 5xx.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(message) => {
                const TRANSIENT_PATTERNS: [&str; 5] = [
                    "ECONNRESET",
                    "ETIMEDOUT",
                    "ENOTFOUND",
                    "ECONNREFUSED",
                    "Network timeout",
                ];
                TRANSIENT_PATTERNS.iter().any(|p| message.contains(p))
                    || message.contains("timed out")
                    || message.contains("connect")
            }
            Self::ServerStatus(status) => *status >= 500,
            _ => false,
        }
    }
}

impl From<manifold_core::CoreError> for AuthError {
    fn from(err: manifold_core::CoreError) -> Self {
        Self::Config(err.to_string())
    }
}
