//! Token types and token-response processing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AuthError, AuthResult, OAuthErrorKind};

/// Proactive refresh happens this long before `expires_at`.
pub const REFRESH_BUFFER_SECS: i64 = 5 * 60;

/// A stored access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    /// The bearer credential itself
    pub access_token: String,
    /// Token type, `Bearer` unless the server says otherwise
    pub token_type: String,
    /// Absolute expiry instant
    pub expires_at: DateTime<Utc>,
    /// Granted scope, when the server reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenData {
    /// Trim whitespace from the credential fields, rejecting an empty
    /// access token. Non-destructive: returns the sanitized copy.
    pub fn sanitized(&self) -> AuthResult<Self> {
        let access_token = self.access_token.trim();
        if access_token.is_empty() {
            return Err(AuthError::Storage("access token must not be empty".to_string()));
        }
        let token_type = self.token_type.trim();
        Ok(Self {
            access_token: access_token.to_string(),
            token_type: if token_type.is_empty() { "Bearer".to_string() } else { token_type.to_string() },
            expires_at: self.expires_at,
            scope: self.scope.clone(),
        })
    }

    /// Whether the token is expired, judged `buffer` before the real expiry.
    #[must_use]
    pub fn is_expired(&self, buffer: ChronoDuration) -> bool {
        Utc::now() >= self.expires_at - buffer
    }

    /// The `Authorization` header value for this token.
    #[must_use]
    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// Wire shape of a token-endpoint response, success and error fields
/// combined the way RFC 6749 servers actually answer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    /// Access token on success
    pub access_token: Option<String>,
    /// Token type, defaults to `Bearer`
    pub token_type: Option<String>,
    /// Lifetime in seconds, defaults to 3600
    pub expires_in: Option<u64>,
    /// Granted scope
    pub scope: Option<String>,
    /// Token audience, validated when the provider configures one
    pub audience: Option<String>,
    /// RFC 6749 error code on failure
    pub error: Option<String>,
    /// Human-readable error detail
    pub error_description: Option<String>,
}

/// Turn a token response into [`TokenData`], optionally validating the
/// audience.
///
/// # Errors
///
/// An `error` member maps to the corresponding [`OAuthErrorKind`]; a missing
/// or empty `access_token` fails as a parse error; an audience mismatch is
/// surfaced as `invalid_grant`.
pub fn process_token_response(
    response: TokenResponse,
    expected_audience: Option<&str>,
) -> AuthResult<TokenData> {
    if let Some(code) = response.error {
        let description = response.error_description.unwrap_or_else(|| code.clone());
        return Err(AuthError::OAuth {
            kind: OAuthErrorKind::from_code(&code),
            description,
        });
    }

    let access_token = match response.access_token {
        Some(token) if !token.trim().is_empty() => token,
        _ => return Err(AuthError::TokenParse),
    };

    if let (Some(expected), Some(actual)) = (expected_audience, response.audience.as_deref())
        && expected != actual
    {
        return Err(AuthError::AudienceMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    let expires_in = response.expires_in.unwrap_or(3600);
    let token = TokenData {
        access_token,
        token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expires_at: Utc::now() + ChronoDuration::seconds(expires_in as i64),
        scope: response.scope,
    };
    debug!(expires_in, scope = ?token.scope, "token response processed");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn response_ok(token: &str) -> TokenResponse {
        TokenResponse {
            access_token: Some(token.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_sanitize_trims_and_defaults() {
        let token = TokenData {
            access_token: "  tok  ".to_string(),
            token_type: "  ".to_string(),
            expires_at: Utc::now(),
            scope: None,
        };
        let clean = token.sanitized().unwrap();
        assert_eq!(clean.access_token, "tok");
        assert_eq!(clean.token_type, "Bearer");
    }

    #[test]
    fn test_sanitize_rejects_empty_token() {
        let token = TokenData {
            access_token: "   ".to_string(),
            token_type: "Bearer".to_string(),
            expires_at: Utc::now(),
            scope: None,
        };
        assert!(matches!(token.sanitized(), Err(AuthError::Storage(_))));
    }

    #[test]
    fn test_expiry_respects_buffer() {
        let token = TokenData {
            access_token: "t".to_string(),
            token_type: "Bearer".to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(120),
            scope: None,
        };
        assert!(!token.is_expired(ChronoDuration::zero()));
        assert!(token.is_expired(ChronoDuration::seconds(REFRESH_BUFFER_SECS)));
    }

    #[test]
    fn test_process_defaults() {
        let token = process_token_response(response_ok("T"), None).unwrap();
        assert_eq!(token.token_type, "Bearer");
        let lifetime = token.expires_at - Utc::now();
        assert!(lifetime > ChronoDuration::seconds(3590) && lifetime <= ChronoDuration::seconds(3600));
    }

    #[test]
    fn test_process_error_body() {
        let response = TokenResponse {
            error: Some("invalid_client".to_string()),
            error_description: Some("Client authentication failed".to_string()),
            ..Default::default()
        };
        let err = process_token_response(response, None).unwrap_err();
        assert_eq!(
            err,
            AuthError::OAuth {
                kind: OAuthErrorKind::InvalidClient,
                description: "Client authentication failed".to_string(),
            }
        );
    }

    #[test]
    fn test_process_missing_token_is_parse_failure() {
        let err = process_token_response(TokenResponse::default(), None).unwrap_err();
        assert_eq!(err, AuthError::TokenParse);
    }

    #[test]
    fn test_audience_validation() {
        let mut response = response_ok("T");
        response.audience = Some("https://other".to_string());
        let err = process_token_response(response, Some("https://api.example.com")).unwrap_err();
        assert!(matches!(err, AuthError::AudienceMismatch { .. }));

        // absent audience in the response is accepted
        let token = process_token_response(response_ok("T"), Some("https://api.example.com"));
        assert!(token.is_ok());
    }
}
