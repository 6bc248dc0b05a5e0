//! Session token lifecycle: proactive refresh, caller queuing, re-auth
//! fallback.
//!
//! States: INITIAL → VALID → (REFRESHING → VALID | ERROR) → EXPIRED. The
//! refresh fires `refresh_buffer` (default 2 h) before expiry so callers
//! never observe an expired token under normal operation. While a refresh
//! is in flight, concurrent `get_token` callers park on a bounded FIFO
//! queue and are woken with the fresh token (or the terminal error).

use super::error::ApiError;
use super::token_store::TokenStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Initial,
    Valid,
    Refreshing,
    Error,
    Expired,
}

#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// The credential exchange against the brokerage. Implemented by the REST
/// layer; faked in tests.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Full authentication with stored credentials.
    async fn authenticate(&self) -> Result<AuthToken, ApiError>;

    /// Revalidate (or re-issue) the current token. The default simply
    /// issues a fresh one.
    async fn validate(&self, _current: &str) -> Result<AuthToken, ApiError> {
        self.authenticate().await
    }
}

#[derive(Debug, Clone)]
pub struct TokenManagerConfig {
    pub refresh_buffer: Duration,
    pub max_refresh_retries: u32,
    pub refresh_retry_delays: Vec<Duration>,
    pub max_queue_depth: usize,
    pub queue_wait_timeout: Duration,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(7200),
            max_refresh_retries: 4,
            refresh_retry_delays: vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
            max_queue_depth: 100,
            queue_wait_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenInfo {
    token: String,
    expires_at: DateTime<Utc>,
    refresh_trigger_at: DateTime<Utc>,
    state: TokenState,
}

struct Inner {
    info: Option<TokenInfo>,
    waiters: VecDeque<oneshot::Sender<Result<String, ApiError>>>,
}

pub struct TokenManager {
    auth: Arc<dyn AuthService>,
    store: Option<Arc<TokenStore>>,
    config: TokenManagerConfig,
    inner: Mutex<Inner>,
    // Exactly one refresh or re-auth in flight at a time.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new(
        auth: Arc<dyn AuthService>,
        store: Option<Arc<TokenStore>>,
        config: TokenManagerConfig,
    ) -> Self {
        info!(
            refresh_buffer_s = config.refresh_buffer.as_secs(),
            max_retries = config.max_refresh_retries,
            max_queue_depth = config.max_queue_depth,
            "token manager initialized"
        );
        Self {
            auth,
            store,
            config,
            inner: Mutex::new(Inner {
                info: None,
                waiters: VecDeque::new(),
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Pre-seed with a token recovered from the encrypted store.
    pub fn seed(&self, token: String, expires_at: DateTime<Utc>) {
        let info = self.make_info(token, expires_at);
        self.inner.lock().info = Some(info);
        debug!("token manager seeded from store");
    }

    fn make_info(&self, token: String, expires_at: DateTime<Utc>) -> TokenInfo {
        let buffer = chrono::Duration::from_std(self.config.refresh_buffer)
            .unwrap_or_else(|_| chrono::Duration::seconds(7200));
        TokenInfo {
            token,
            expires_at,
            refresh_trigger_at: expires_at - buffer,
            state: TokenState::Valid,
        }
    }

    pub fn state(&self) -> TokenState {
        self.inner
            .lock()
            .info
            .as_ref()
            .map(|i| i.state)
            .unwrap_or(TokenState::Initial)
    }

    pub fn time_until_expiry(&self) -> Option<chrono::Duration> {
        self.inner
            .lock()
            .info
            .as_ref()
            .map(|i| i.expires_at - Utc::now())
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Drop the current token (e.g. after a 401) so the next caller
    /// re-authenticates.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        if let Some(info) = inner.info.as_mut() {
            info.state = TokenState::Expired;
        }
        warn!("token invalidated, next caller will re-authenticate");
    }

    /// Get a usable bearer token, authenticating / refreshing as needed.
    pub async fn get_token(&self) -> Result<String, ApiError> {
        enum Plan {
            Use(String),
            Wait(oneshot::Receiver<Result<String, ApiError>>),
            Refresh,
            Reauth,
        }

        let plan = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let now = Utc::now();
            match inner.info.as_mut() {
                None => Plan::Reauth,
                Some(info) => {
                    if now >= info.expires_at && info.state != TokenState::Refreshing {
                        warn!("token has expired");
                        info.state = TokenState::Expired;
                    }
                    match info.state {
                        TokenState::Refreshing => {
                            if inner.waiters.len() >= self.config.max_queue_depth {
                                error!(
                                    depth = inner.waiters.len(),
                                    "token request queue full, failing caller"
                                );
                                return Err(ApiError::Permanent {
                                    status: None,
                                    message: "REQUEST_QUEUE_FULL: too many callers queued during token refresh".to_string(),
                                });
                            }
                            let (tx, rx) = oneshot::channel();
                            inner.waiters.push_back(tx);
                            Plan::Wait(rx)
                        }
                        TokenState::Expired | TokenState::Error => Plan::Reauth,
                        TokenState::Valid | TokenState::Initial => {
                            if now >= info.refresh_trigger_at {
                                Plan::Refresh
                            } else {
                                Plan::Use(info.token.clone())
                            }
                        }
                    }
                }
            }
        };

        match plan {
            Plan::Use(token) => Ok(token),
            Plan::Wait(rx) => match tokio::time::timeout(self.config.queue_wait_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ApiError::Authentication(
                    "token refresh abandoned".to_string(),
                )),
                Err(_) => Err(ApiError::Transient {
                    status: None,
                    message: "timed out waiting for token refresh".to_string(),
                }),
            },
            Plan::Refresh => self.refresh().await,
            Plan::Reauth => self.reauthenticate().await,
        }
    }

    /// Refresh loop: up to `max_refresh_retries` validation attempts with
    /// the fixed delay ladder, then fallback to full re-auth.
    async fn refresh(&self) -> Result<String, ApiError> {
        let _gate = self.refresh_gate.lock().await;

        // Another caller may have finished the refresh while we waited.
        let current = {
            let mut inner = self.inner.lock();
            match inner.info.as_mut() {
                Some(info) if info.state == TokenState::Valid
                    && Utc::now() < info.refresh_trigger_at =>
                {
                    debug!("token already refreshed by another caller");
                    return Ok(info.token.clone());
                }
                Some(info) => {
                    info.state = TokenState::Refreshing;
                    info.token.clone()
                }
                None => return Err(ApiError::Authentication("no token to refresh".to_string())),
            }
        };
        info!("starting token refresh");

        for attempt in 0..self.config.max_refresh_retries {
            match self.auth.validate(&current).await {
                Ok(fresh) => {
                    info!("token refresh successful");
                    return Ok(self.install(fresh));
                }
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        max = self.config.max_refresh_retries,
                        error = %err,
                        "token refresh attempt failed"
                    );
                }
            }

            if attempt + 1 < self.config.max_refresh_retries {
                let delay = self
                    .config
                    .refresh_retry_delays
                    .get(attempt as usize)
                    .copied()
                    .unwrap_or_else(|| {
                        self.config
                            .refresh_retry_delays
                            .last()
                            .copied()
                            .unwrap_or(Duration::from_secs(300))
                    });
                warn!(delay_s = delay.as_secs(), "waiting before refresh retry");
                tokio::time::sleep(delay).await;
            }
        }

        error!(
            attempts = self.config.max_refresh_retries,
            "token refresh exhausted retries, falling back to re-authentication"
        );
        self.transition(TokenState::Error);
        self.reauth_locked().await
    }

    /// Full re-authentication (initial auth and ERROR/EXPIRED recovery).
    async fn reauthenticate(&self) -> Result<String, ApiError> {
        let _gate = self.refresh_gate.lock().await;

        // Re-check: the holder of the gate before us may have succeeded.
        {
            let inner = self.inner.lock();
            if let Some(info) = inner.info.as_ref() {
                if info.state == TokenState::Valid && Utc::now() < info.expires_at {
                    return Ok(info.token.clone());
                }
            }
        }
        self.reauth_locked().await
    }

    async fn reauth_locked(&self) -> Result<String, ApiError> {
        info!("performing full authentication");
        match self.auth.authenticate().await {
            Ok(fresh) => {
                info!(expires_at = %fresh.expires_at, "authentication successful");
                Ok(self.install(fresh))
            }
            Err(err) => {
                error!(error = %err, "authentication failed");
                self.transition(TokenState::Error);
                self.fail_waiters(&err);
                Err(err)
            }
        }
    }

    /// Store the fresh token, transition VALID, and wake queued callers in
    /// FIFO order. A dropped waiter does not halt the drain.
    fn install(&self, fresh: AuthToken) -> String {
        if let Some(store) = &self.store {
            if let Err(err) = store.store(&fresh.token, fresh.expires_at) {
                warn!(error = %err, "failed to persist refreshed token");
            }
        }

        let waiters = {
            let mut inner = self.inner.lock();
            inner.info = Some(self.make_info(fresh.token.clone(), fresh.expires_at));
            std::mem::take(&mut inner.waiters)
        };

        if !waiters.is_empty() {
            info!(count = waiters.len(), "draining queued token requests");
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(fresh.token.clone()));
        }
        fresh.token
    }

    fn fail_waiters(&self, err: &ApiError) {
        let waiters = std::mem::take(&mut self.inner.lock().waiters);
        if !waiters.is_empty() {
            error!(count = waiters.len(), "failing queued token requests");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn transition(&self, state: TokenState) {
        let mut inner = self.inner.lock();
        if let Some(info) = inner.info.as_mut() {
            debug!(from = ?info.state, to = ?state, "token state transition");
            info.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeAuth {
        calls: AtomicU32,
        fail_first: u32,
        lifetime: chrono::Duration,
    }

    impl FakeAuth {
        fn new(lifetime: chrono::Duration) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                lifetime,
            }
        }

        fn failing_first(n: u32, lifetime: chrono::Duration) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: n,
                lifetime,
            }
        }
    }

    #[async_trait]
    impl AuthService for FakeAuth {
        async fn authenticate(&self) -> Result<AuthToken, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(ApiError::Transient {
                    status: Some(503),
                    message: "auth backend down".to_string(),
                });
            }
            Ok(AuthToken {
                token: format!("token-{}", n + 1),
                expires_at: Utc::now() + self.lifetime,
            })
        }
    }

    fn manager(auth: FakeAuth) -> TokenManager {
        TokenManager::new(Arc::new(auth), None, TokenManagerConfig::default())
    }

    #[tokio::test]
    async fn test_initial_auth_then_cached() {
        let mgr = manager(FakeAuth::new(chrono::Duration::hours(10)));
        assert_eq!(mgr.state(), TokenState::Initial);

        let first = mgr.get_token().await.unwrap();
        assert_eq!(first, "token-1");
        assert_eq!(mgr.state(), TokenState::Valid);

        // Well before the refresh trigger: same token, no new auth call.
        let second = mgr.get_token().await.unwrap();
        assert_eq!(second, "token-1");
    }

    #[tokio::test]
    async fn test_refresh_inside_buffer_window() {
        // Expires in 1h, buffer is 2h: first get_token authenticates, the
        // next call is already past the refresh trigger and re-issues.
        let mgr = manager(FakeAuth::new(chrono::Duration::hours(1)));
        assert_eq!(mgr.get_token().await.unwrap(), "token-1");
        assert_eq!(mgr.get_token().await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn test_expired_token_forces_reauth() {
        let mgr = manager(FakeAuth::new(chrono::Duration::hours(10)));
        mgr.get_token().await.unwrap();

        mgr.invalidate();
        assert_eq!(mgr.state(), TokenState::Expired);
        assert_eq!(mgr.get_token().await.unwrap(), "token-2");
        assert_eq!(mgr.state(), TokenState::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_retries_then_recovers() {
        // Seeded token is inside the 2h refresh buffer, so get_token runs
        // the refresh ladder: attempts 1 and 2 fail, attempt 3 succeeds.
        let auth = FakeAuth::failing_first(2, chrono::Duration::hours(10));
        let mgr = TokenManager::new(
            Arc::new(auth),
            None,
            TokenManagerConfig {
                refresh_retry_delays: vec![Duration::from_millis(10); 4],
                ..TokenManagerConfig::default()
            },
        );
        mgr.seed("old".to_string(), Utc::now() + chrono::Duration::minutes(30));
        assert_eq!(mgr.get_token().await.unwrap(), "token-3");
        assert_eq!(mgr.state(), TokenState::Valid);
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces() {
        let mgr = manager(FakeAuth::failing_first(100, chrono::Duration::hours(10)));
        let err = mgr.get_token().await.unwrap_err();
        assert!(matches!(err, ApiError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_seeded_token_is_used_without_auth() {
        let mgr = manager(FakeAuth::new(chrono::Duration::hours(10)));
        mgr.seed("seeded".to_string(), Utc::now() + chrono::Duration::hours(10));
        assert_eq!(mgr.get_token().await.unwrap(), "seeded");
    }

    #[tokio::test]
    async fn test_concurrent_callers_single_auth() {
        let mgr = Arc::new(manager(FakeAuth::new(chrono::Duration::hours(10))));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move { mgr.get_token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
    }
}
