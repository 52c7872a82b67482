//! Token storage backends.

mod keychain;
mod memory;

pub use keychain::KeychainTokenStore;
pub use memory::MemoryTokenStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use futures::future::BoxFuture;

use crate::error::AuthResult;
use crate::types::TokenData;

/// Callback invoked when a scheduled proactive refresh fires.
pub type RefreshCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A store holding at most one current access token.
///
/// Implementations serialize their mutating operations; callers never
/// observe a half-applied store or clear.
#[async_trait]
pub trait TokenStore: Send + Sync + fmt::Debug {
    /// Store a token, replacing any current one. Input is sanitized; an
    /// empty access token is rejected.
    async fn store(&self, token: TokenData) -> AuthResult<()>;

    /// Retrieve a copy of the current token, if any.
    async fn retrieve(&self) -> AuthResult<Option<TokenData>>;

    /// Drop the current token and cancel any scheduled refresh.
    async fn clear(&self) -> AuthResult<()>;

    /// Whether the current token is missing or expires within `buffer`.
    async fn is_expired(&self, buffer: ChronoDuration) -> bool;

    /// Whether this store can arm proactive-refresh timers.
    fn supports_refresh_scheduling(&self) -> bool {
        false
    }

    /// Register a refresh callback. Stores that support scheduling re-arm a
    /// timer at `expires_at − buffer` on every subsequent [`Self::store`].
    async fn schedule_refresh(&self, _callback: RefreshCallback) -> AuthResult<()> {
        Ok(())
    }
}
