//! Token-endpoint HTTP plumbing shared by the OAuth2 flows.

use std::future::Future;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::warn;
use url::Url;

use crate::error::{AuthError, AuthResult};
use crate::types::TokenResponse;

/// Attempts made per logical token request, counting the first.
pub const MAX_TOKEN_ATTEMPTS: u32 = 3;

/// POST a form to a token endpoint and decode the response.
///
/// 2xx bodies must parse as a token response; 5xx is a transient server
/// status; any other status must carry an RFC 6749 error body, and a body
/// that parses as neither fails as a token-parse error.
pub async fn post_token_request(
    http: &reqwest::Client,
    endpoint: &Url,
    form: &[(&str, String)],
    basic_auth: Option<(&str, &SecretString)>,
    request_id: Option<&str>,
) -> AuthResult<TokenResponse> {
    let mut request = http
        .post(endpoint.clone())
        .header("Content-Type", "application/x-www-form-urlencoded")
        .timeout(Duration::from_secs(30))
        .form(form);
    if let Some((client_id, secret)) = basic_auth {
        request = request.basic_auth(client_id, Some(secret.expose_secret()));
    }
    if let Some(id) = request_id {
        request = request.header("X-Request-ID", id);
    }

    let response = request
        .send()
        .await
        .map_err(|e| AuthError::Network(e.to_string()))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| AuthError::Network(e.to_string()))?;

    if status.is_server_error() {
        return Err(AuthError::ServerStatus(status.as_u16()));
    }

    let parsed: TokenResponse =
        serde_json::from_slice(&body).map_err(|_| AuthError::TokenParse)?;

    if !status.is_success() && parsed.error.is_none() {
        // A 4xx without an RFC 6749 error body is unclassifiable.
        return Err(AuthError::TokenParse);
    }
    Ok(parsed)
}

/// Run a token request up to [`MAX_TOKEN_ATTEMPTS`] times.
///
/// Only transient failures retry, with 1 s then 2 s between attempts; other
/// errors propagate immediately. The closure receives the 1-based attempt
/// number so callers can keep per-request identifiers stable across retries.
pub async fn request_with_retry<F, Fut, T>(mut operation: F) -> AuthResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AuthResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < MAX_TOKEN_ATTEMPTS => {
                let delay = Duration::from_secs(1 << (attempt - 1));
                warn!(
                    attempt,
                    remaining = MAX_TOKEN_ATTEMPTS - attempt,
                    delay_secs = delay.as_secs(),
                    "transient token request failure, retrying: {error}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let result = request_with_retry(|_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AuthError::ServerStatus(503))
                } else {
                    Ok("token")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "token");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_three() {
        let calls = AtomicU32::new(0);
        let result: AuthResult<()> = request_with_retry(|_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AuthError::ServerStatus(500)) }
        })
        .await;
        assert!(matches!(result, Err(AuthError::ServerStatus(500))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: AuthResult<()> = request_with_retry(|_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AuthError::OAuth {
                    kind: crate::error::OAuthErrorKind::InvalidClient,
                    description: "bad".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
