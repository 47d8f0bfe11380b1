//! Session validation and silent refresh on top of the identity provider.
//!
//! Flow Overview:
//! 1) Read credentials from cookies or a bearer header.
//! 2) Ask the identity provider for the session (transient errors retried).
//! 3) Classify: no session, expired, valid, valid but due for refresh.
//! 4) Refresh only sessions inside the refresh threshold. A refresh must
//!    extend `expires_at`; invalid refresh tokens are terminal and clear the
//!    session instead of being retried.
//!
//! Auth state changes are published on a broadcast channel so caches keyed by
//! user can drop their entries on sign-out.

pub mod cookies;
mod identity;

pub use identity::HttpIdentityProvider;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::broadcast;

use super::{clock::Clock, logger::SecureLogger, retry::RetryPolicy};

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(15 * 60);
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct Session {
    pub user_id: String,
    pub email: Option<String>,
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
}

/// Raw credentials presented by the caller.
#[derive(Clone, Debug, Default)]
pub struct SessionCredentials {
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
}

impl SessionCredentials {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn { user_id: String },
    SignedOut { user_id: Option<String> },
    TokenRefreshed { user_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
    #[error("identity provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("identity provider returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Errors worth another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidResponse(_) => false,
        }
    }

    /// The refresh token is invalid, missing, revoked or already used. No
    /// retry can succeed.
    #[must_use]
    pub fn is_invalid_refresh_token(&self) -> bool {
        let message = match self {
            Self::Rejected { message, .. } | Self::InvalidResponse(message) => message,
            Self::Unavailable(_) => return false,
        };
        let message = message.to_lowercase();
        let mentions_refresh = message.contains("refresh token") || message.contains("refresh_token");
        mentions_refresh
            && ["invalid", "not found", "missing", "expired", "revoked", "already used"]
                .iter()
                .any(|needle| message.contains(needle))
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` when the credentials do not identify a session.
    async fn get_session(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<Option<Session>, ProviderError>;

    async fn refresh_session(&self, refresh_token: &SecretString) -> Result<Session, ProviderError>;

    async fn sign_out(&self, access_token: &SecretString) -> Result<(), ProviderError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionReason {
    Valid,
    Refreshed,
    NoSession,
    Expired,
    RefreshFailed,
}

impl SessionReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Refreshed => "refreshed",
            Self::NoSession => "no_session",
            Self::Expired => "expired",
            Self::RefreshFailed => "refresh_failed",
        }
    }
}

impl fmt::Display for SessionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct SessionCheck {
    pub is_valid: bool,
    pub session: Option<Session>,
    pub needs_refresh: bool,
    pub reason: SessionReason,
    /// Set when the session was cleared because of a non-retryable refresh
    /// error. The caller must send the user to the login page.
    pub terminal: bool,
}

impl SessionCheck {
    fn invalid(reason: SessionReason) -> Self {
        Self {
            is_valid: false,
            session: None,
            needs_refresh: false,
            reason,
            terminal: false,
        }
    }

    fn valid(session: Session, needs_refresh: bool, reason: SessionReason) -> Self {
        Self {
            is_valid: true,
            session: Some(session),
            needs_refresh,
            reason,
            terminal: false,
        }
    }

    /// User id of a valid session.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.session
            .as_ref()
            .filter(|_| self.is_valid)
            .map(|session| session.user_id.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_age: Duration,
    pub refresh_threshold: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
        }
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub struct SessionValidator {
    provider: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    logger: Arc<SecureLogger>,
    config: SessionConfig,
    retry: RetryPolicy,
    events: broadcast::Sender<AuthEvent>,
}

impl fmt::Debug for SessionValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionValidator")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl SessionValidator {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        logger: Arc<SecureLogger>,
        config: SessionConfig,
        retry: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            provider,
            clock,
            logger,
            config,
            retry,
            events,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to auth state changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Publish an auth state change. Having no subscriber is fine.
    pub fn publish(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }

    fn classify(&self, session: Session) -> SessionCheck {
        let now = self.clock.now_ms();
        if session.expires_at_ms < now {
            return SessionCheck::invalid(SessionReason::Expired);
        }
        if now - session.issued_at_ms > duration_ms(self.config.max_age) {
            return SessionCheck::invalid(SessionReason::Expired);
        }
        let needs_refresh =
            session.expires_at_ms - now < duration_ms(self.config.refresh_threshold);
        SessionCheck::valid(session, needs_refresh, SessionReason::Valid)
    }

    /// Determine whether the credentials carry a usable session.
    pub async fn validate_session(&self, credentials: &SessionCredentials) -> SessionCheck {
        if credentials.is_empty() {
            return SessionCheck::invalid(SessionReason::NoSession);
        }

        let provider = self.provider.clone();
        let result = self
            .retry
            .run(
                "get_session",
                |_| {
                    let provider = provider.clone();
                    async move { provider.get_session(credentials).await }
                },
                ProviderError::is_transient,
            )
            .await;

        match result {
            Ok(Some(session)) => self.classify(session),
            Ok(None) => SessionCheck::invalid(SessionReason::NoSession),
            Err(err) if err.is_invalid_refresh_token() => {
                self.logger
                    .warning("Session rejected with invalid refresh token", &[]);
                // The provider gave no session; the caller's token still names the user.
                let user_id = credentials
                    .access_token
                    .as_ref()
                    .and_then(|token| identity::token_subject(token.expose_secret()));
                self.clear_session(credentials, user_id.as_deref()).await;
                SessionCheck {
                    terminal: true,
                    ..SessionCheck::invalid(SessionReason::RefreshFailed)
                }
            }
            Err(err) => {
                // Unverified sessions are treated as absent.
                self.logger
                    .error(&format!("Session verification failed: {err}"), &[]);
                SessionCheck::invalid(SessionReason::NoSession)
            }
        }
    }

    /// Validate, then refresh only when the session is inside the refresh
    /// threshold.
    pub async fn refresh_session_if_needed(&self, credentials: &SessionCredentials) -> SessionCheck {
        let check = self.validate_session(credentials).await;
        if !check.is_valid || !check.needs_refresh {
            return check;
        }
        let Some(current) = check.session.clone() else {
            return check;
        };
        let Some(refresh_token) = current
            .refresh_token
            .clone()
            .or_else(|| credentials.refresh_token.clone())
        else {
            return check;
        };

        let provider = self.provider.clone();
        let result = self
            .retry
            .run(
                "refresh_session",
                |_| {
                    let provider = provider.clone();
                    let refresh_token = refresh_token.clone();
                    async move { provider.refresh_session(&refresh_token).await }
                },
                |err: &ProviderError| err.is_transient() && !err.is_invalid_refresh_token(),
            )
            .await;

        match result {
            Ok(refreshed) if refreshed.expires_at_ms > current.expires_at_ms => {
                self.publish(AuthEvent::TokenRefreshed {
                    user_id: refreshed.user_id.clone(),
                });
                self.logger
                    .debug("Session refreshed", &[("user_id", refreshed.user_id.as_str())]);
                SessionCheck::valid(refreshed, false, SessionReason::Refreshed)
            }
            Ok(_) => {
                self.logger.warning(
                    "Refresh did not extend session expiry, keeping current session",
                    &[("user_id", current.user_id.as_str())],
                );
                SessionCheck {
                    reason: SessionReason::RefreshFailed,
                    ..check
                }
            }
            Err(err) if err.is_invalid_refresh_token() => {
                self.logger.warning(
                    "Refresh token rejected, clearing session",
                    &[("user_id", current.user_id.as_str())],
                );
                self.clear_session(credentials, Some(&current.user_id)).await;
                SessionCheck {
                    terminal: true,
                    ..SessionCheck::invalid(SessionReason::RefreshFailed)
                }
            }
            Err(err) => {
                self.logger.warning(
                    &format!("Session refresh failed: {err}"),
                    &[("user_id", current.user_id.as_str())],
                );
                SessionCheck {
                    reason: SessionReason::RefreshFailed,
                    ..check
                }
            }
        }
    }

    /// Sign out at the provider and announce it. Safe to call repeatedly;
    /// provider errors are logged, never returned.
    pub async fn clear_session(&self, credentials: &SessionCredentials, user_id: Option<&str>) {
        if let Some(access_token) = &credentials.access_token {
            if let Err(err) = self.provider.sign_out(access_token).await {
                self.logger
                    .debug(&format!("Provider sign-out failed: {err}"), &[]);
            }
        }
        self.publish(AuthEvent::SignedOut {
            user_id: user_id.map(ToString::to_string),
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gateway::{
        clock::ManualClock, logger::LoggerSettings, retry::Backoff, store::MemoryStore,
    };
    use secrecy::ExposeSecret;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) const NOW: i64 = 1_700_000_000_000;
    const MINUTE_MS: i64 = 60 * 1000;

    /// Identity provider answering from canned results.
    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub(crate) session: Mutex<Option<Result<Option<Session>, ProviderError>>>,
        pub(crate) refresh: Mutex<Option<Result<Session, ProviderError>>>,
        pub(crate) get_calls: AtomicU32,
        pub(crate) refresh_calls: AtomicU32,
        pub(crate) sign_out_calls: AtomicU32,
    }

    #[async_trait]
    impl IdentityProvider for FakeProvider {
        async fn get_session(
            &self,
            _credentials: &SessionCredentials,
        ) -> Result<Option<Session>, ProviderError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.session
                .lock()
                .map_err(|_| ProviderError::Unavailable("poisoned".to_string()))?
                .clone()
                .unwrap_or(Ok(None))
        }

        async fn refresh_session(&self, _token: &SecretString) -> Result<Session, ProviderError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh
                .lock()
                .map_err(|_| ProviderError::Unavailable("poisoned".to_string()))?
                .clone()
                .unwrap_or_else(|| Err(ProviderError::Unavailable("no refresh".to_string())))
        }

        async fn sign_out(&self, _token: &SecretString) -> Result<(), ProviderError> {
            self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn session(user_id: &str, issued_at_ms: i64, expires_at_ms: i64) -> Session {
        Session {
            user_id: user_id.to_string(),
            email: Some(format!("{user_id}@example.com")),
            issued_at_ms,
            expires_at_ms,
            access_token: SecretString::from(format!("access-{user_id}-{expires_at_ms}")),
            refresh_token: Some(SecretString::from(format!("refresh-{user_id}"))),
        }
    }

    pub(crate) fn credentials() -> SessionCredentials {
        SessionCredentials {
            access_token: Some(SecretString::from("access")),
            refresh_token: Some(SecretString::from("refresh")),
        }
    }

    fn validator(provider: Arc<FakeProvider>) -> SessionValidator {
        let clock = Arc::new(ManualClock::new(NOW));
        let logger = Arc::new(SecureLogger::new(
            LoggerSettings::default(),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        ));
        SessionValidator::new(
            provider,
            clock,
            logger,
            SessionConfig::default(),
            RetryPolicy::new(3, Duration::ZERO, Backoff::Fixed),
        )
    }

    fn with_session(result: Result<Option<Session>, ProviderError>) -> Arc<FakeProvider> {
        let provider = FakeProvider::default();
        if let Ok(mut slot) = provider.session.lock() {
            *slot = Some(result);
        }
        Arc::new(provider)
    }

    #[tokio::test]
    async fn missing_credentials_means_no_session() {
        let provider = Arc::new(FakeProvider::default());
        let validator = validator(provider.clone());
        let check = validator
            .validate_session(&SessionCredentials::default())
            .await;
        assert!(!check.is_valid);
        assert_eq!(check.reason, SessionReason::NoSession);
        assert_eq!(provider.get_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_session_is_invalid() {
        let provider = with_session(Ok(Some(session("u1", NOW - 60 * MINUTE_MS, NOW - 1))));
        let check = validator(provider).validate_session(&credentials()).await;
        assert!(!check.is_valid);
        assert_eq!(check.reason, SessionReason::Expired);
    }

    #[tokio::test]
    async fn session_older_than_max_age_is_expired() {
        let provider = with_session(Ok(Some(session(
            "u1",
            NOW - 25 * 60 * MINUTE_MS,
            NOW + 60 * MINUTE_MS,
        ))));
        let check = validator(provider).validate_session(&credentials()).await;
        assert_eq!(check.reason, SessionReason::Expired);
    }

    #[tokio::test]
    async fn near_expiry_needs_refresh() {
        let provider = with_session(Ok(Some(session("u1", NOW, NOW + 10 * MINUTE_MS))));
        let check = validator(provider).validate_session(&credentials()).await;
        assert!(check.is_valid);
        assert!(check.needs_refresh);

        let provider = with_session(Ok(Some(session("u1", NOW, NOW + 50 * MINUTE_MS))));
        let check = validator(provider).validate_session(&credentials()).await;
        assert!(check.is_valid);
        assert!(!check.needs_refresh);
        assert_eq!(check.user_id(), Some("u1"));
    }

    #[tokio::test]
    async fn transient_errors_retried_then_unverified() {
        let provider = with_session(Err(ProviderError::Unavailable("timeout".to_string())));
        let check = validator(provider.clone())
            .validate_session(&credentials())
            .await;
        assert!(!check.is_valid);
        assert_eq!(check.reason, SessionReason::NoSession);
        assert_eq!(provider.get_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fresh_session_is_not_refreshed() {
        let provider = with_session(Ok(Some(session("u1", NOW, NOW + 50 * MINUTE_MS))));
        let check = validator(provider.clone())
            .refresh_session_if_needed(&credentials())
            .await;
        assert_eq!(check.reason, SessionReason::Valid);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_session_is_refreshed_and_announced() {
        let provider = with_session(Ok(Some(session("u1", NOW, NOW + 5 * MINUTE_MS))));
        if let Ok(mut slot) = provider.refresh.lock() {
            *slot = Some(Ok(session("u1", NOW, NOW + 60 * MINUTE_MS)));
        }
        let validator = validator(provider.clone());
        let mut events = validator.subscribe();

        let check = validator.refresh_session_if_needed(&credentials()).await;
        assert!(check.is_valid);
        assert_eq!(check.reason, SessionReason::Refreshed);
        assert_eq!(
            check.session.as_ref().map(|s| s.expires_at_ms),
            Some(NOW + 60 * MINUTE_MS)
        );
        assert_eq!(
            events.try_recv().ok(),
            Some(AuthEvent::TokenRefreshed {
                user_id: "u1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn refresh_that_does_not_extend_expiry_fails() {
        let provider = with_session(Ok(Some(session("u1", NOW, NOW + 5 * MINUTE_MS))));
        if let Ok(mut slot) = provider.refresh.lock() {
            *slot = Some(Ok(session("u1", NOW, NOW + 5 * MINUTE_MS)));
        }
        let check = validator(provider)
            .refresh_session_if_needed(&credentials())
            .await;
        assert!(check.is_valid);
        assert_eq!(check.reason, SessionReason::RefreshFailed);
        assert!(!check.terminal);
    }

    #[tokio::test]
    async fn invalid_refresh_token_is_terminal_and_not_retried() {
        let provider = with_session(Ok(Some(session("u1", NOW, NOW + 5 * MINUTE_MS))));
        if let Ok(mut slot) = provider.refresh.lock() {
            *slot = Some(Err(ProviderError::Rejected {
                status: 400,
                message: "Invalid Refresh Token: Refresh Token Not Found".to_string(),
            }));
        }
        let validator = validator(provider.clone());
        let mut events = validator.subscribe();

        let check = validator.refresh_session_if_needed(&credentials()).await;
        assert!(!check.is_valid);
        assert!(check.terminal);
        assert_eq!(check.reason, SessionReason::RefreshFailed);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.sign_out_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            events.try_recv().ok(),
            Some(AuthEvent::SignedOut {
                user_id: Some("u1".to_string())
            })
        );
    }

    #[tokio::test]
    async fn rejected_lookup_signs_out_the_token_owner() {
        use base64ct::{Base64UrlUnpadded, Encoding};

        let provider = with_session(Err(ProviderError::Rejected {
            status: 400,
            message: "Invalid Refresh Token: Already Used".to_string(),
        }));
        let validator = validator(provider.clone());
        let mut events = validator.subscribe();
        let payload = Base64UrlUnpadded::encode_string(br#"{"sub":"u1","exp":1}"#);
        let credentials = SessionCredentials {
            access_token: Some(SecretString::from(format!("eyJhbGciOiJIUzI1NiJ9.{payload}.sig"))),
            refresh_token: Some(SecretString::from("refresh")),
        };

        let check = validator.validate_session(&credentials).await;
        assert!(check.terminal);
        assert_eq!(provider.get_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            events.try_recv().ok(),
            Some(AuthEvent::SignedOut {
                user_id: Some("u1".to_string())
            })
        );
    }

    #[tokio::test]
    async fn transient_refresh_failure_keeps_session() {
        let provider = with_session(Ok(Some(session("u1", NOW, NOW + 5 * MINUTE_MS))));
        if let Ok(mut slot) = provider.refresh.lock() {
            *slot = Some(Err(ProviderError::Unavailable("reset".to_string())));
        }
        let check = validator(provider.clone())
            .refresh_session_if_needed(&credentials())
            .await;
        assert!(check.is_valid);
        assert_eq!(check.reason, SessionReason::RefreshFailed);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn clear_session_is_idempotent() {
        let provider = Arc::new(FakeProvider::default());
        let validator = validator(provider.clone());
        validator.clear_session(&credentials(), Some("u1")).await;
        validator.clear_session(&credentials(), Some("u1")).await;
        validator
            .clear_session(&SessionCredentials::default(), None)
            .await;
        assert_eq!(provider.sign_out_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn refresh_token_error_classification() {
        let terminal = ProviderError::Rejected {
            status: 400,
            message: "Invalid Refresh Token: Already Used".to_string(),
        };
        assert!(terminal.is_invalid_refresh_token());
        assert!(!terminal.is_transient());

        let other = ProviderError::Rejected {
            status: 400,
            message: "email not confirmed".to_string(),
        };
        assert!(!other.is_invalid_refresh_token());
        assert!(ProviderError::Rejected {
            status: 503,
            message: String::new()
        }
        .is_transient());
    }

    #[test]
    fn session_tokens_are_not_debug_printed() {
        let session = session("u1", NOW, NOW + 1);
        let printed = format!("{session:?}");
        assert!(!printed.contains(session.access_token.expose_secret()));
    }
}
