use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

use super::coordinator::{RefreshCoordinator, RefreshSettings};
use super::credentials::CredentialStore;
use super::gateway::AuthGateway;
use super::types::{AuthEvent, Session, User};
use crate::error::{Result, SessionError};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Process-wide authentication state shared by the context and the coordinator
pub struct SessionState {
    user: RwLock<Option<User>>,
    loading: AtomicBool,
    events: broadcast::Sender<AuthEvent>,
}

impl SessionState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            user: RwLock::new(None),
            loading: AtomicBool::new(false),
            events,
        }
    }

    pub async fn user(&self) -> Option<User> {
        self.user.read().await.clone()
    }

    pub fn loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: AuthEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) async fn set_user(&self, user: Option<User>) {
        *self.user.write().await = user;
    }

    /// Drop the identity after an irrecoverable refresh failure
    pub(crate) async fn expire(&self) {
        self.set_user(None).await;
        self.emit(AuthEvent::SessionExpired);
    }

    fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the loading flag when an operation ends, however it ends
struct LoadingGuard<'a>(&'a SessionState);

impl<'a> LoadingGuard<'a> {
    fn start(state: &'a SessionState) -> Self {
        state.set_loading(true);
        Self(state)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_loading(false);
    }
}

/// Authentication state and orchestration for the whole process.
///
/// Construct once at startup and share by `Arc`. Token handling is delegated
/// to the [`RefreshCoordinator`] and the [`CredentialStore`] below it.
pub struct SessionContext {
    store: Arc<dyn CredentialStore>,
    gateway: Arc<dyn AuthGateway>,
    coordinator: Arc<RefreshCoordinator>,
    state: Arc<SessionState>,

    /// Serializes login/register/logout/initialize
    operation: Mutex<()>,
}

impl SessionContext {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        gateway: Arc<dyn AuthGateway>,
        settings: RefreshSettings,
    ) -> Self {
        let state = Arc::new(SessionState::new());
        let coordinator =
            RefreshCoordinator::new(store.clone(), gateway.clone(), state.clone(), settings);

        Self {
            store,
            gateway,
            coordinator,
            state,
            operation: Mutex::new(()),
        }
    }

    pub async fn user(&self) -> Option<User> {
        self.state.user().await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.user.read().await.is_some()
    }

    pub fn loading(&self) -> bool {
        self.state.loading()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.state.subscribe()
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User> {
        let _op = self
            .operation
            .try_lock()
            .map_err(|_| SessionError::OperationInProgress)?;
        let _loading = LoadingGuard::start(&self.state);

        let session = self.gateway.login(email, password).await.map_err(|e| {
            tracing::warn!(email = %email, "Login failed: {}", e);
            e
        })?;

        self.establish(session).await
    }

    pub async fn register(&self, email: &str, password: &str, display_name: &str) -> Result<User> {
        let _op = self
            .operation
            .try_lock()
            .map_err(|_| SessionError::OperationInProgress)?;
        let _loading = LoadingGuard::start(&self.state);

        let session = self
            .gateway
            .register(email, password, display_name)
            .await
            .map_err(|e| {
                tracing::warn!(email = %email, "Registration failed: {}", e);
                e
            })?;

        self.establish(session).await
    }

    /// End the session. Local teardown always happens; remote invalidation is
    /// best-effort and its failures are only logged.
    ///
    /// A refresh in flight for this session is detached and can no longer
    /// write the store.
    pub async fn logout(&self) {
        let _op = self.operation.lock().await;
        let _loading = LoadingGuard::start(&self.state);

        let previous = self
            .coordinator
            .replace_session(|store| {
                let previous = store.get();
                if let Err(e) = store.clear() {
                    tracing::error!("Failed to clear credential store on logout: {}", e);
                }
                previous
            })
            .await;

        match previous {
            Ok(tokens) => {
                if let Some(refresh_token) = tokens.refresh_token() {
                    if let Err(e) = self.gateway.logout(refresh_token).await {
                        tracing::warn!("Remote logout failed, local session already cleared: {}", e);
                    }
                }
            }
            Err(e) => tracing::error!("Could not read credentials for remote logout: {}", e),
        }

        self.state.set_user(None).await;
        self.state.emit(AuthEvent::LoggedOut);
        tracing::info!("Logged out");
    }

    /// Restore the session persisted by a previous run.
    ///
    /// Rejected credentials are cleared and the context starts unauthenticated.
    /// Network and storage failures propagate and leave the store untouched.
    pub async fn initialize(&self) -> Result<Option<User>> {
        let _op = self.operation.lock().await;
        let _loading = LoadingGuard::start(&self.state);

        if self.store.get()?.refresh_token().is_none() {
            tracing::debug!("No stored session");
            return Ok(None);
        }

        match self.fetch_current_user().await {
            Ok(user) => {
                tracing::info!(user_id = %user.id, "Restored stored session");
                self.state.set_user(Some(user.clone())).await;
                self.state.emit(AuthEvent::LoggedIn(user.clone()));
                Ok(Some(user))
            }
            Err(e) if e.requires_login() => {
                tracing::warn!("Stored session rejected, starting unauthenticated: {}", e);
                self.coordinator
                    .replace_session(|store| store.clear())
                    .await?;
                self.state.set_user(None).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-fetch the identity behind the current token
    pub async fn current_user(&self) -> Result<User> {
        let user = self.fetch_current_user().await?;
        self.state.set_user(Some(user.clone())).await;
        Ok(user)
    }

    async fn fetch_current_user(&self) -> Result<User> {
        let gateway = self.gateway.clone();
        self.coordinator
            .execute(move |access_token| {
                let gateway = gateway.clone();
                async move { gateway.current_user(&access_token).await }
            })
            .await
    }

    async fn establish(&self, session: Session) -> Result<User> {
        self.coordinator
            .replace_session(|store| store.put(&session.access_token, &session.refresh_token))
            .await?;
        self.state.set_user(Some(session.user.clone())).await;
        self.state.emit(AuthEvent::LoggedIn(session.user.clone()));
        tracing::info!(user_id = %session.user.id, "Session established");
        Ok(session.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::coordinator::RefreshState;
    use crate::auth::credentials::MemoryCredentialStore;
    use crate::auth::types::{Role, TokenGrant};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn user() -> User {
        User {
            id: "u-1".to_string(),
            email: "guide@test.io".to_string(),
            display_name: "Guide".to_string(),
            role: Role::User,
            created_at: None,
        }
    }

    #[derive(Default)]
    struct FakeGateway {
        login_gate: Option<Arc<Notify>>,
        refresh_gate: Option<Arc<Notify>>,
        refresh_grants: bool,
        logout_fails: bool,
        me_rejects: bool,
    }

    #[async_trait]
    impl AuthGateway for FakeGateway {
        async fn login(&self, _email: &str, password: &str) -> Result<Session> {
            if let Some(gate) = &self.login_gate {
                gate.notified().await;
            }
            if password != "correct horse" {
                return Err(SessionError::InvalidCredentials("Invalid email or password".to_string()));
            }
            Ok(Session {
                access_token: "access-1".to_string(),
                refresh_token: "refresh-1".to_string(),
                user: user(),
            })
        }

        async fn register(&self, email: &str, _: &str, _: &str) -> Result<Session> {
            if email == "taken@test.io" {
                return Err(SessionError::EmailTaken("Email already registered".to_string()));
            }
            Ok(Session {
                access_token: "access-1".to_string(),
                refresh_token: "refresh-1".to_string(),
                user: user(),
            })
        }

        async fn refresh(&self, _: &str) -> Result<TokenGrant> {
            if let Some(gate) = &self.refresh_gate {
                gate.notified().await;
            }
            if self.refresh_grants {
                Ok(TokenGrant {
                    access_token: "access-refreshed".to_string(),
                    refresh_token: Some("refresh-rotated".to_string()),
                })
            } else {
                Err(SessionError::RefreshTokenInvalid("revoked".to_string()))
            }
        }

        async fn logout(&self, _: &str) -> Result<()> {
            if self.logout_fails {
                Err(SessionError::NetworkError("connection refused".to_string()))
            } else {
                Ok(())
            }
        }

        async fn current_user(&self, _: &str) -> Result<User> {
            if self.me_rejects {
                Err(SessionError::Unauthorized("token revoked".to_string()))
            } else {
                Ok(user())
            }
        }
    }

    fn settings() -> RefreshSettings {
        RefreshSettings {
            proactive_refresh: false,
            retry_base_delay_ms: 1,
            ..RefreshSettings::default()
        }
    }

    fn context(store: Arc<MemoryCredentialStore>, gateway: FakeGateway) -> SessionContext {
        SessionContext::new(store, Arc::new(gateway), settings())
    }

    /// Start a request that gets rejected and parks the refresh on `gate`
    async fn start_blocked_refresh(
        store: Arc<MemoryCredentialStore>,
        gate: Arc<Notify>,
        refresh_grants: bool,
    ) -> (Arc<SessionContext>, tokio::task::JoinHandle<Result<User>>) {
        let ctx = Arc::new(context(
            store,
            FakeGateway {
                refresh_gate: Some(gate),
                refresh_grants,
                me_rejects: true,
                ..FakeGateway::default()
            },
        ));

        let request = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.current_user().await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !ctx.coordinator().is_refreshing().await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        (ctx, request)
    }

    /// Let the released refresh cycle run to completion
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_login_success_persists_session() {
        let store = Arc::new(MemoryCredentialStore::new());
        let ctx = context(store.clone(), FakeGateway::default());
        let mut events = ctx.subscribe();

        let user = ctx.login("guide@test.io", "correct horse").await.unwrap();

        assert_eq!(user.email, "guide@test.io");
        assert!(ctx.is_authenticated().await);
        assert!(!ctx.loading());
        assert_eq!(store.get().unwrap().access_token(), Some("access-1"));
        assert_eq!(events.recv().await.unwrap(), AuthEvent::LoggedIn(user));
    }

    #[tokio::test]
    async fn test_login_failure_leaves_store_empty() {
        let store = Arc::new(MemoryCredentialStore::new());
        let ctx = context(store.clone(), FakeGateway::default());

        let err = ctx.login("x@test.io", "short").await.unwrap_err();

        assert!(matches!(err, SessionError::InvalidCredentials(_)));
        assert!(store.get().unwrap().is_empty());
        assert!(ctx.user().await.is_none());
        assert!(!ctx.loading());
    }

    #[tokio::test]
    async fn test_concurrent_login_is_rejected() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let ctx = Arc::new(context(
            store,
            FakeGateway {
                login_gate: Some(gate.clone()),
                ..FakeGateway::default()
            },
        ));

        let first = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.login("guide@test.io", "correct horse").await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !ctx.loading() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let err = ctx.register("other@test.io", "pw", "Other").await.unwrap_err();
        assert_eq!(err, SessionError::OperationInProgress);

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert!(ctx.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_register_surfaces_email_taken() {
        let store = Arc::new(MemoryCredentialStore::new());
        let ctx = context(store.clone(), FakeGateway::default());

        let err = ctx.register("taken@test.io", "pw", "T").await.unwrap_err();

        assert!(matches!(err, SessionError::EmailTaken(_)));
        assert!(store.get().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_remote_fails() {
        let store = Arc::new(MemoryCredentialStore::new());
        let ctx = context(
            store.clone(),
            FakeGateway {
                logout_fails: true,
                ..FakeGateway::default()
            },
        );
        ctx.login("guide@test.io", "correct horse").await.unwrap();

        ctx.logout().await;

        assert!(store.get().unwrap().is_empty());
        assert!(ctx.user().await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_restores_session() {
        let store = Arc::new(MemoryCredentialStore::with_tokens("access-1", "refresh-1"));
        let ctx = context(store.clone(), FakeGateway::default());

        let restored = ctx.initialize().await.unwrap();

        assert_eq!(restored, Some(user()));
        assert!(ctx.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_initialize_clears_rejected_session() {
        let store = Arc::new(MemoryCredentialStore::with_tokens("access-1", "refresh-1"));
        let ctx = context(
            store.clone(),
            FakeGateway {
                me_rejects: true,
                ..FakeGateway::default()
            },
        );

        let restored = ctx.initialize().await.unwrap();

        assert_eq!(restored, None);
        assert!(store.get().unwrap().is_empty());
        assert!(!ctx.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_initialize_without_stored_session() {
        let store = Arc::new(MemoryCredentialStore::new());
        let ctx = context(store, FakeGateway::default());
        assert_eq!(ctx.initialize().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_logout_during_refresh_stays_logged_out() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(MemoryCredentialStore::with_tokens("access-A", "refresh-A"));
        let (ctx, request) = start_blocked_refresh(store.clone(), gate.clone(), true).await;

        ctx.logout().await;
        assert!(store.get().unwrap().is_empty());

        // The waiting request is released by the logout, not by the refresh
        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::SessionExpired(_)), "got {:?}", err);

        gate.notify_one();
        settle().await;

        assert!(store.get().unwrap().is_empty());
        assert!(ctx.user().await.is_none());
        assert_eq!(ctx.coordinator().state().await, RefreshState::Idle);
    }

    #[tokio::test]
    async fn test_failed_refresh_of_old_session_keeps_new_login() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(MemoryCredentialStore::with_tokens("access-A", "refresh-A"));
        let (ctx, _request) = start_blocked_refresh(store.clone(), gate.clone(), false).await;
        let mut events = ctx.subscribe();

        ctx.logout().await;
        let user = ctx.login("guide@test.io", "correct horse").await.unwrap();

        gate.notify_one();
        settle().await;

        let tokens = store.get().unwrap();
        assert_eq!(tokens.access_token(), Some("access-1"));
        assert_eq!(tokens.refresh_token(), Some("refresh-1"));
        assert_eq!(ctx.user().await, Some(user.clone()));

        assert_eq!(events.recv().await.unwrap(), AuthEvent::LoggedOut);
        assert_eq!(events.recv().await.unwrap(), AuthEvent::LoggedIn(user));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_successful_refresh_of_old_session_does_not_overwrite_new_login() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(MemoryCredentialStore::with_tokens("access-A", "refresh-A"));
        let (ctx, _request) = start_blocked_refresh(store.clone(), gate.clone(), true).await;

        ctx.logout().await;
        ctx.login("guide@test.io", "correct horse").await.unwrap();

        gate.notify_one();
        settle().await;

        let tokens = store.get().unwrap();
        assert_eq!(tokens.access_token(), Some("access-1"));
        assert_eq!(tokens.refresh_token(), Some("refresh-1"));
        assert!(ctx.is_authenticated().await);
        assert_eq!(ctx.coordinator().state().await, RefreshState::Idle);
    }
}
