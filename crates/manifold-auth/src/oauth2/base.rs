//! Shared OAuth2 provider base.
//!
//! Flow-agnostic token lifecycle: validity checks against the store,
//! single-flight refresh (concurrent callers share one in-flight
//! acquisition), and proactive refresh scheduling through stores that
//! support it. Storage failures never fail an acquisition; the token is
//! still handed to the caller and the failure is logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};
use crate::provider::AuthProvider;
use crate::store::TokenStore;
use crate::types::{REFRESH_BUFFER_SECS, TokenData};

/// How a concrete flow acquires a fresh token.
#[async_trait]
pub trait TokenFlow: Send + Sync + std::fmt::Debug + 'static {
    /// Acquire a new token from the authorization server. Implementations
    /// handle their own wire format, retry policy, and audience validation.
    async fn acquire_token(&self) -> AuthResult<TokenData>;
}

type SharedAcquisition = Shared<BoxFuture<'static, AuthResult<TokenData>>>;

struct ProviderInner<F: TokenFlow> {
    flow: F,
    store: Arc<dyn TokenStore>,
    inflight: StdMutex<Option<SharedAcquisition>>,
}

/// OAuth2 provider: a [`TokenFlow`] paired with a [`TokenStore`].
pub struct OAuth2Provider<F: TokenFlow> {
    inner: Arc<ProviderInner<F>>,
}

impl<F: TokenFlow> Clone for OAuth2Provider<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: TokenFlow> std::fmt::Debug for OAuth2Provider<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Provider")
            .field("flow", &self.inner.flow)
            .field("store", &self.inner.store)
            .finish()
    }
}

impl<F: TokenFlow> OAuth2Provider<F> {
    /// Create a provider and register proactive refresh with the store when
    /// the store supports scheduling.
    pub async fn new(flow: F, store: Arc<dyn TokenStore>) -> Self {
        let provider = Self {
            inner: Arc::new(ProviderInner {
                flow,
                store,
                inflight: StdMutex::new(None),
            }),
        };

        if provider.inner.store.supports_refresh_scheduling() {
            let weak: Weak<ProviderInner<F>> = Arc::downgrade(&provider.inner);
            let callback = Arc::new(move || -> BoxFuture<'static, ()> {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let provider = OAuth2Provider { inner };
                    match provider.refresh().await {
                        Ok(_) => debug!("proactive token refresh completed"),
                        Err(e) => warn!("proactive token refresh failed: {e}"),
                    }
                }
                .boxed()
            });
            if let Err(e) = provider.inner.store.schedule_refresh(callback).await {
                warn!("failed to register proactive refresh: {e}");
            }
        }

        provider
    }

    /// The underlying flow.
    #[must_use]
    pub fn flow(&self) -> &F {
        &self.inner.flow
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.inner.store
    }

    /// Whether a stored token exists and is not expired (judged with the
    /// proactive-refresh buffer).
    pub async fn is_valid(&self) -> bool {
        !self
            .inner
            .store
            .is_expired(ChronoDuration::seconds(REFRESH_BUFFER_SECS))
            .await
    }

    /// Refresh the token, sharing one in-flight acquisition among
    /// concurrent callers.
    pub async fn refresh(&self) -> AuthResult<TokenData> {
        let acquisition = {
            let mut inflight = self.inner.inflight.lock().expect("inflight mutex poisoned");
            match inflight.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let fresh: SharedAcquisition = async move {
                        let token = inner.flow.acquire_token().await?;
                        if let Err(e) = inner.store.store(token.clone()).await {
                            // Non-fatal: the caller still gets the token.
                            warn!("failed to store acquired token: {e}");
                        }
                        Ok(token)
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(fresh.clone());
                    fresh
                }
            }
        };

        let result = acquisition.await;

        let mut inflight = self.inner.inflight.lock().expect("inflight mutex poisoned");
        if inflight.as_ref().is_some_and(|f| f.peek().is_some()) {
            *inflight = None;
        }
        result
    }

    /// Return the stored token if still valid, refreshing otherwise.
    pub async fn ensure_valid_token(&self) -> AuthResult<TokenData> {
        if self.is_valid().await
            && let Some(token) = self.inner.store.retrieve().await?
        {
            return Ok(token);
        }

        self.refresh().await?;

        match self.inner.store.retrieve().await? {
            Some(token) => Ok(token),
            None => Err(AuthError::TokenAcquisition),
        }
    }
}

#[async_trait]
impl<F: TokenFlow> AuthProvider for OAuth2Provider<F> {
    async fn get_headers(&self) -> AuthResult<HashMap<String, String>> {
        let token = self.ensure_valid_token().await?;
        let mut headers = HashMap::with_capacity(1);
        headers.insert("Authorization".to_string(), token.authorization_value());
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTokenStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct CountingFlow {
        calls: Arc<AtomicU32>,
        delay: Duration,
    }

    #[async_trait]
    impl TokenFlow for CountingFlow {
        async fn acquire_token(&self) -> AuthResult<TokenData> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(TokenData {
                access_token: format!("token-{call}"),
                token_type: "Bearer".to_string(),
                expires_at: Utc::now() + ChronoDuration::seconds(3600),
                scope: None,
            })
        }
    }

    async fn provider(calls: Arc<AtomicU32>, delay: Duration) -> OAuth2Provider<CountingFlow> {
        OAuth2Provider::new(
            CountingFlow { calls, delay },
            Arc::new(MemoryTokenStore::new()),
        )
        .await
    }

    #[tokio::test]
    async fn test_single_flight_refresh() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = provider(Arc::clone(&calls), Duration::from_millis(100)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move { provider.refresh().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "one acquisition per completion");
    }

    #[tokio::test]
    async fn test_sequential_refreshes_acquire_again() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = provider(Arc::clone(&calls), Duration::ZERO).await;

        provider.refresh().await.unwrap();
        provider.refresh().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ensure_valid_token_uses_store() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = provider(Arc::clone(&calls), Duration::ZERO).await;

        let first = provider.ensure_valid_token().await.unwrap();
        let second = provider.ensure_valid_token().await.unwrap();
        assert_eq!(first.access_token, second.access_token);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "valid token is not re-acquired");
    }

    #[tokio::test]
    async fn test_get_headers_shape() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = provider(calls, Duration::ZERO).await;

        let headers = provider.get_headers().await.unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["Authorization"], "Bearer token-0");
    }

    #[derive(Debug)]
    struct FailingFlow;

    #[async_trait]
    impl TokenFlow for FailingFlow {
        async fn acquire_token(&self) -> AuthResult<TokenData> {
            Err(AuthError::TokenParse)
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_propagates_and_clears_flight() {
        let provider =
            OAuth2Provider::new(FailingFlow, Arc::new(MemoryTokenStore::new()) as Arc<dyn TokenStore>)
                .await;
        assert!(provider.refresh().await.is_err());
        // the failed flight is cleared, a later refresh tries again
        assert!(provider.refresh().await.is_err());
    }
}
