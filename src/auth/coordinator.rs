use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

use super::context::SessionState;
use super::credentials::CredentialStore;
use super::gateway::AuthGateway;
use super::token;
use super::types::{redact, AuthEvent, TokenGrant};
use crate::error::{Result, SessionError};
use crate::http_client::backoff_delay;

/// Tuning for the refresh cycle
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Seconds before the `exp` claim at which a token counts as stale
    pub safety_margin_secs: i64,

    /// Refresh before sending when the token is already inside the margin
    pub proactive_refresh: bool,

    /// Retries of a refresh call that failed with a network error
    pub max_network_retries: u32,

    /// Base delay for exponential backoff between refresh retries (milliseconds)
    pub retry_base_delay_ms: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            safety_margin_secs: 60,
            proactive_refresh: true,
            max_network_retries: 2,
            retry_base_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

/// Re-runs a stalled request once the refresh outcome is known
type Replay = Box<dyn FnOnce(Result<String>) -> BoxFuture<'static, ()> + Send>;

struct PendingRequest {
    id: u64,
    replay: Replay,
}

struct Inner {
    state: RefreshState,
    queue: VecDeque<PendingRequest>,
    next_id: u64,

    /// Bumped each time the session is replaced or torn down. A refresh cycle
    /// only commits its outcome while the generation it started under is current.
    generation: u64,
}

enum Admission {
    Queued { position: usize },
    StartedRefresh { generation: u64 },
    ReplayNow(String, PendingRequest),
}

/// Single-flight token refresh with FIFO replay of stalled requests.
///
/// State and queue live behind one mutex, so moving `Idle -> Refreshing` and
/// appending to the queue happen as one step. The lock is never held across
/// network calls or replays. Store writes that must not race a session change
/// (committing a refresh outcome, replacing the session) run under it.
pub struct RefreshCoordinator {
    store: Arc<dyn CredentialStore>,
    gateway: Arc<dyn AuthGateway>,
    session: Arc<SessionState>,
    settings: RefreshSettings,
    inner: Mutex<Inner>,

    /// Bumped under `inner` after every store write made through the coordinator
    store_version: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        gateway: Arc<dyn AuthGateway>,
        session: Arc<SessionState>,
        settings: RefreshSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            gateway,
            session,
            settings,
            inner: Mutex::new(Inner {
                state: RefreshState::Idle,
                queue: VecDeque::new(),
                next_id: 0,
                generation: 0,
            }),
            store_version: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    pub async fn state(&self) -> RefreshState {
        self.inner.lock().await.state
    }

    pub async fn is_refreshing(&self) -> bool {
        self.state().await == RefreshState::Refreshing
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Latest access token in the store
    pub fn access_token(&self) -> Result<Option<String>> {
        Ok(self.store.get()?.access_token().map(str::to_string))
    }

    /// Run `op` with the current access token, recovering one authorization
    /// failure by refreshing and replaying.
    ///
    /// `op` performs the raw request and reports a rejected token as
    /// [`SessionError::Unauthorized`]. It must not call back into `execute` on
    /// the same coordinator.
    pub async fn execute<T, F, Fut>(self: &Arc<Self>, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let token = self
            .access_token()?
            .ok_or_else(|| SessionError::SessionExpired("No active session".to_string()))?;

        if self.settings.proactive_refresh
            && token::is_expired(&token, self.settings.safety_margin_secs)
        {
            tracing::debug!(
                token = %redact(&token),
                "Access token inside safety margin, refreshing before send"
            );
            return self.handle_auth_failure(token, op).await;
        }

        match op(token.clone()).await {
            Err(SessionError::Unauthorized(msg)) => {
                tracing::warn!("Request unauthorized ({}), routing through token refresh", msg);
                self.handle_auth_failure(token, op).await
            }
            other => other,
        }
    }

    /// Handle a request that observed `stale_token` being rejected.
    ///
    /// Joins the in-flight refresh if there is one, starts one otherwise, and
    /// resolves with the outcome of a single replay of `op`.
    pub async fn handle_auth_failure<T, F, Fut>(
        self: &Arc<Self>,
        stale_token: String,
        op: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T>>();

        let replay: Replay = Box::new(move |outcome| {
            async move {
                if tx.is_closed() {
                    tracing::debug!("Queued request abandoned by its caller, skipping replay");
                    return;
                }
                let result = match outcome {
                    Ok(access_token) => match op(access_token).await {
                        Err(SessionError::Unauthorized(msg)) => Err(SessionError::SessionExpired(
                            format!("Request rejected again after refresh: {}", msg),
                        )),
                        other => other,
                    },
                    Err(err) => Err(err),
                };
                let _ = tx.send(result);
            }
            .boxed()
        });

        match self.admit(&stale_token, replay).await? {
            Admission::Queued { position } => {
                tracing::debug!(position, "Refresh in flight, request queued");
            }
            Admission::StartedRefresh { generation } => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_refresh_cycle(generation).await });
            }
            Admission::ReplayNow(access_token, pending) => {
                tracing::debug!(
                    request_id = pending.id,
                    "Token already refreshed by an earlier cycle, replaying directly"
                );
                (pending.replay)(Ok(access_token)).await;
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(SessionError::SessionExpired(
                "Refresh cycle ended without answering the request".to_string(),
            ))
        })
    }

    /// Replace or tear down the session.
    ///
    /// `write` runs against the store under the coordinator lock. A refresh
    /// cycle started for the previous session is detached: its outcome is
    /// discarded and the requests waiting on it get `SessionExpired`.
    pub(crate) async fn replace_session<R>(
        &self,
        write: impl FnOnce(&dyn CredentialStore) -> R,
    ) -> R {
        let (result, orphaned) = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            let result = write(self.store.as_ref());
            self.store_version.fetch_add(1, Ordering::SeqCst);

            let orphaned = if inner.state == RefreshState::Refreshing {
                inner.state = RefreshState::Idle;
                std::mem::take(&mut inner.queue)
            } else {
                VecDeque::new()
            };
            (result, orphaned)
        };

        if !orphaned.is_empty() {
            tracing::warn!(
                rejected = orphaned.len(),
                "Session replaced during token refresh, rejecting queued requests"
            );
            self.reject(
                orphaned,
                SessionError::SessionExpired("Session ended during token refresh".to_string()),
            )
            .await;
        }
        result
    }

    async fn admit(&self, stale_token: &str, replay: Replay) -> Result<Admission> {
        // Read outside the lock; re-read under it only if a write slipped in between
        let version = self.store_version.load(Ordering::SeqCst);
        let mut tokens = self.store.get()?;

        let mut inner = self.inner.lock().await;
        let pending = PendingRequest {
            id: inner.next_id,
            replay,
        };
        inner.next_id += 1;

        if inner.state == RefreshState::Refreshing {
            inner.queue.push_back(pending);
            return Ok(Admission::Queued {
                position: inner.queue.len(),
            });
        }

        if self.store_version.load(Ordering::SeqCst) != version {
            tokens = self.store.get()?;
        }
        let Some(current) = tokens.access_token() else {
            return Err(SessionError::SessionExpired("No active session".to_string()));
        };

        let current_is_usable = current != stale_token
            && !(self.settings.proactive_refresh
                && token::is_expired(current, self.settings.safety_margin_secs));
        if current_is_usable {
            return Ok(Admission::ReplayNow(current.to_string(), pending));
        }

        inner.state = RefreshState::Refreshing;
        inner.queue.push_back(pending);
        Ok(Admission::StartedRefresh {
            generation: inner.generation,
        })
    }

    async fn run_refresh_cycle(self: Arc<Self>, generation: u64) {
        tracing::info!("Refreshing access token...");
        let outcome = self.request_grant().await;

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            tracing::warn!("Session replaced while refreshing, discarding the refresh outcome");
            return;
        }

        match outcome.and_then(|(grant, used)| self.commit(grant, &used)) {
            Ok(access_token) => {
                drop(inner);
                self.session.emit(AuthEvent::TokenRefreshed);
                self.drain(generation, access_token).await;
            }
            Err(err) => {
                tracing::error!("Token refresh failed: {}", err);

                if let Err(e) = self.store.clear() {
                    tracing::error!("Failed to clear credential store after refresh failure: {}", e);
                }
                self.store_version.fetch_add(1, Ordering::SeqCst);
                self.session.expire().await;

                inner.state = RefreshState::Idle;
                let queue = std::mem::take(&mut inner.queue);
                drop(inner);

                let outcome = match err {
                    SessionError::StorageUnavailable(msg) => SessionError::StorageUnavailable(msg),
                    SessionError::SessionExpired(msg) => SessionError::SessionExpired(msg),
                    other => SessionError::SessionExpired(other.to_string()),
                };
                self.reject(queue, outcome).await;
            }
        }
    }

    /// Exchange the stored refresh token, returning the grant and the token used
    async fn request_grant(&self) -> Result<(TokenGrant, String)> {
        let refresh_token = self
            .store
            .get()?
            .refresh_token()
            .map(str::to_string)
            .ok_or_else(|| SessionError::SessionExpired("No refresh token available".to_string()))?;

        let max_retries = self.settings.max_network_retries;
        let mut attempt = 0;
        loop {
            match self.gateway.refresh(&refresh_token).await {
                Ok(grant) => return Ok((grant, refresh_token)),
                Err(SessionError::NetworkError(msg)) if attempt < max_retries => {
                    let delay = backoff_delay(self.settings.retry_base_delay_ms, attempt);
                    tracing::warn!(
                        "Token refresh failed: {}, retrying after {}ms (attempt {}/{})",
                        msg,
                        delay.as_millis(),
                        attempt + 1,
                        max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Persist a grant. Called with the coordinator lock held.
    fn commit(&self, grant: TokenGrant, used_refresh_token: &str) -> Result<String> {
        if grant.refresh_token.is_some() {
            tracing::debug!("Server rotated the refresh token");
        }
        let next_refresh = grant.refresh_token.as_deref().unwrap_or(used_refresh_token);
        self.store.put(&grant.access_token, next_refresh)?;
        self.store_version.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            expires_at = ?token::expires_at(&grant.access_token),
            "Access token refreshed"
        );
        Ok(grant.access_token)
    }

    /// Replay queued requests in arrival order. Requests queued while draining
    /// are picked up too; the state returns to `Idle` only once the queue is
    /// observed empty under the lock. Stops if the session is replaced, since
    /// the replacement already took the queue.
    async fn drain(&self, generation: u64, access_token: String) {
        let mut replayed = 0usize;
        loop {
            let pending = {
                let mut inner = self.inner.lock().await;
                if inner.generation != generation {
                    tracing::warn!(replayed, "Session replaced while replaying, stopping");
                    return;
                }
                match inner.queue.pop_front() {
                    Some(pending) => pending,
                    None => {
                        inner.state = RefreshState::Idle;
                        break;
                    }
                }
            };

            tracing::debug!(request_id = pending.id, "Replaying queued request");
            let replay = (pending.replay)(Ok(access_token.clone()));
            if AssertUnwindSafe(replay).catch_unwind().await.is_err() {
                tracing::error!(request_id = pending.id, "Queued request panicked during replay");
            }
            replayed += 1;
        }

        tracing::info!(replayed, "Refresh cycle complete");
    }

    /// Reject taken-over requests in arrival order
    async fn reject(&self, queue: VecDeque<PendingRequest>, err: SessionError) {
        tracing::warn!(rejected = queue.len(), "Rejecting queued requests");
        for pending in queue {
            let replay = (pending.replay)(Err(err.clone()));
            if AssertUnwindSafe(replay).catch_unwind().await.is_err() {
                tracing::error!(request_id = pending.id, "Queued request panicked during rejection");
            }
        }
    }
}
