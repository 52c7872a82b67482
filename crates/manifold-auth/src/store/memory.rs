//! In-memory token store.
//!
//! All operations are funneled through a command channel into one owning
//! task, so stores, retrievals, and clears are serialized without a lock
//! held across await points. The task also owns the proactive-refresh
//! timer: every store re-arms it at `expires_at − buffer`, and a clear
//! cancels it.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};
use crate::store::{RefreshCallback, TokenStore};
use crate::types::{REFRESH_BUFFER_SECS, TokenData};

enum Command {
    Store(TokenData, oneshot::Sender<AuthResult<()>>),
    Retrieve(oneshot::Sender<Option<TokenData>>),
    Clear(oneshot::Sender<()>),
    IsExpired(ChronoDuration, oneshot::Sender<bool>),
    ScheduleRefresh(RefreshCallback, oneshot::Sender<()>),
}

/// Queue-based in-memory token store.
#[derive(Clone)]
pub struct MemoryTokenStore {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTokenStore").finish_non_exhaustive()
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

struct Worker {
    current: Option<TokenData>,
    refresh_callback: Option<RefreshCallback>,
    refresh_timer: Option<JoinHandle<()>>,
}

impl Worker {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.refresh_timer.take() {
            timer.abort();
        }
    }

    fn arm_timer(&mut self) {
        self.cancel_timer();
        let (Some(token), Some(callback)) = (&self.current, &self.refresh_callback) else {
            return;
        };

        let fire_at = token.expires_at - ChronoDuration::seconds(REFRESH_BUFFER_SECS);
        let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();
        debug!(delay_secs = delay.as_secs(), "proactive refresh scheduled");

        let callback = callback.clone();
        self.refresh_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback().await;
        }));
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Store(token, reply) => {
                let outcome = token.sanitized().map(|clean| {
                    self.current = Some(clean);
                    self.arm_timer();
                });
                let _ = reply.send(outcome);
            }
            Command::Retrieve(reply) => {
                let _ = reply.send(self.current.clone());
            }
            Command::Clear(reply) => {
                self.current = None;
                self.cancel_timer();
                let _ = reply.send(());
            }
            Command::IsExpired(buffer, reply) => {
                let expired = self.current.as_ref().is_none_or(|t| t.is_expired(buffer));
                let _ = reply.send(expired);
            }
            Command::ScheduleRefresh(callback, reply) => {
                self.refresh_callback = Some(callback);
                self.arm_timer();
                let _ = reply.send(());
            }
        }
    }
}

impl MemoryTokenStore {
    /// Create the store and spawn its owning task.
    #[must_use]
    pub fn new() -> Self {
        let (commands, mut rx) = mpsc::channel::<Command>(32);
        tokio::spawn(async move {
            let mut worker = Worker {
                current: None,
                refresh_callback: None,
                refresh_timer: None,
            };
            while let Some(command) = rx.recv().await {
                worker.handle(command);
            }
            worker.cancel_timer();
        });
        Self { commands }
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> AuthResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| AuthError::Storage("token store task stopped".to_string()))?;
        rx.await
            .map_err(|_| AuthError::Storage("token store task stopped".to_string()))
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn store(&self, token: TokenData) -> AuthResult<()> {
        self.send(|tx| Command::Store(token, tx)).await?
    }

    async fn retrieve(&self) -> AuthResult<Option<TokenData>> {
        self.send(Command::Retrieve).await
    }

    async fn clear(&self) -> AuthResult<()> {
        self.send(Command::Clear).await
    }

    async fn is_expired(&self, buffer: ChronoDuration) -> bool {
        match self.send(|tx| Command::IsExpired(buffer, tx)).await {
            Ok(expired) => expired,
            Err(e) => {
                warn!("token store unavailable, treating token as expired: {e}");
                true
            }
        }
    }

    fn supports_refresh_scheduling(&self) -> bool {
        true
    }

    async fn schedule_refresh(&self, callback: RefreshCallback) -> AuthResult<()> {
        self.send(|tx| Command::ScheduleRefresh(callback, tx)).await
    }
}
