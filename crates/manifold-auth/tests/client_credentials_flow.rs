//! End-to-end Client Credentials flow against a mock authorization server.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use manifold_auth::{
    AuthError, AuthProvider, ClientCredentialsConfig, ClientCredentialsFlow,
    ClientCredentialsProvider, MemoryTokenStore, OAuthErrorKind,
};

fn config(endpoint: String) -> ClientCredentialsConfig {
    ClientCredentialsConfig {
        client_id: "svc".to_string(),
        client_secret: "hunter2".to_string(),
        token_endpoint: endpoint,
        scope: Some("api:read api:write".to_string()),
        audience: Some("https://api.example.com".to_string()),
    }
}

#[tokio::test]
async fn acquires_token_with_exact_wire_format() {
    let server = MockServer::start().await;
    let expected_basic = format!("Basic {}", STANDARD.encode("svc:hunter2"));

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(header("authorization", expected_basic.as_str()))
        .and(body_string(
            "grant_type=client_credentials&scope=api%3Aread+api%3Awrite&audience=https%3A%2F%2Fapi.example.com",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "T",
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "api:read api:write"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let flow = ClientCredentialsFlow::from_config(&config(format!("{}/oauth/token", server.uri())))
        .unwrap();
    let provider = ClientCredentialsProvider::new(flow, Arc::new(MemoryTokenStore::new())).await;

    let before = Utc::now();
    let token = provider.ensure_valid_token().await.unwrap();
    let after = Utc::now();

    assert_eq!(token.access_token, "T");
    assert_eq!(token.token_type, "Bearer");
    assert_eq!(token.scope.as_deref(), Some("api:read api:write"));
    assert!(token.expires_at >= before + ChronoDuration::seconds(3595));
    assert!(token.expires_at <= after + ChronoDuration::seconds(3600));

    // the request id header has the <epoch_ms>_<8 hex> shape
    let requests = server.received_requests().await.unwrap();
    let request_id = requests[0]
        .headers
        .get("x-request-id")
        .expect("X-Request-ID present")
        .to_str()
        .unwrap();
    let (millis, suffix) = request_id.split_once('_').unwrap();
    assert_eq!(millis.len(), 13);
    assert!(millis.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(suffix.len(), 8);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));

    let headers = provider.get_headers().await.unwrap();
    assert_eq!(headers["Authorization"], "Bearer T");
}

#[tokio::test]
async fn oauth_error_body_maps_to_kind() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "invalid_client",
            "error_description": "Client authentication failed"
        })))
        .expect(1) // 4xx is not retried
        .mount(&server)
        .await;

    let flow = ClientCredentialsFlow::from_config(&config(server.uri())).unwrap();
    let provider = ClientCredentialsProvider::new(flow, Arc::new(MemoryTokenStore::new())).await;

    let err = provider.ensure_valid_token().await.unwrap_err();
    assert_eq!(
        err,
        AuthError::OAuth {
            kind: OAuthErrorKind::InvalidClient,
            description: "Client authentication failed".to_string(),
        }
    );
}

#[tokio::test]
async fn audience_mismatch_surfaces_as_invalid_grant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "T",
            "token_type": "Bearer",
            "expires_in": 3600,
            "audience": "https://unexpected.example.com"
        })))
        .mount(&server)
        .await;

    let flow = ClientCredentialsFlow::from_config(&config(server.uri())).unwrap();
    let provider = ClientCredentialsProvider::new(flow, Arc::new(MemoryTokenStore::new())).await;

    let err = provider.ensure_valid_token().await.unwrap_err();
    assert!(matches!(err, AuthError::AudienceMismatch { .. }));
    assert!(err.to_string().contains("invalid_grant"));
}

#[tokio::test]
async fn transient_5xx_retries_with_stable_request_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "after-retries",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    let flow = ClientCredentialsFlow::from_config(&config(server.uri())).unwrap();
    let provider = ClientCredentialsProvider::new(flow, Arc::new(MemoryTokenStore::new())).await;

    let token = provider.ensure_valid_token().await.unwrap();
    assert_eq!(token.access_token, "after-retries");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    let ids: Vec<&str> = requests
        .iter()
        .map(|r| r.headers.get("x-request-id").unwrap().to_str().unwrap())
        .collect();
    assert_eq!(ids[0], ids[1], "request id stable across retries");
    assert_eq!(ids[1], ids[2]);
}

#[tokio::test]
async fn parse_failure_is_reported_as_such() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let flow = ClientCredentialsFlow::from_config(&config(server.uri())).unwrap();
    let provider = ClientCredentialsProvider::new(flow, Arc::new(MemoryTokenStore::new())).await;

    let err = provider.ensure_valid_token().await.unwrap_err();
    assert_eq!(err.to_string(), "Failed to parse OAuth2 token response");
}
