//! Tiered admin role resolution.
//!
//! Flow Overview:
//! 1) Serve from the cache when the entry is younger than the TTL.
//! 2) On a miss, require a session that belongs to the user being resolved.
//! 3) Ask the privilege directory `is_admin` (retried, time-boxed per call).
//! 4) Only for admins, ask `is_master_admin`; a failure there degrades to
//!    plain admin instead of failing the request.
//! 5) Cache successful resolutions. Failures never grant privileges.

mod directory;
mod tracker;

pub use directory::HttpPrivilegeDirectory;
pub use tracker::{AdminStatusTracker, VerificationState};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

use super::{
    clock::Clock,
    logger::SecureLogger,
    retry::RetryPolicy,
    session::{AuthEvent, Session},
    store::Store,
};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Privilege level. Master admins are admins by construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminTier {
    #[default]
    None,
    Admin,
    MasterAdmin,
}

impl AdminTier {
    #[must_use]
    pub fn is_admin(self) -> bool {
        self >= Self::Admin
    }

    #[must_use]
    pub fn is_master_admin(self) -> bool {
        self == Self::MasterAdmin
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Admin => "admin",
            Self::MasterAdmin => "master_admin",
        }
    }
}

impl fmt::Display for AdminTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached resolution for one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminStatus {
    pub user_id: String,
    pub tier: AdminTier,
    pub resolved_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionReason {
    Resolved,
    Cached,
    AuthRequired,
    SessionMismatch,
    Unavailable,
}

impl ResolutionReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Cached => "cached",
            Self::AuthRequired => "auth_required",
            Self::SessionMismatch => "session_mismatch",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminResolution {
    pub tier: AdminTier,
    pub reason: ResolutionReason,
    pub error: Option<String>,
}

impl AdminResolution {
    fn denied(reason: ResolutionReason, error: Option<String>) -> Self {
        Self {
            tier: AdminTier::None,
            reason,
            error,
        }
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.tier.is_admin()
    }

    #[must_use]
    pub fn is_master_admin(&self) -> bool {
        self.tier.is_master_admin()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrivilegeError {
    #[error("privilege call timed out")]
    Timeout,
    #[error("privilege directory unavailable: {0}")]
    Unavailable(String),
    #[error("privilege directory rejected call ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("privilege directory returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl PrivilegeError {
    /// The caller is not authenticated for the privilege call, or lacks the
    /// permission to make it. Retrying cannot help.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        match self {
            Self::Rejected { status, message } => {
                *status == 401 || *status == 403 || mentions_auth_problem(message)
            }
            Self::InvalidResponse(message) | Self::Unavailable(message) => {
                mentions_auth_problem(message)
            }
            Self::Timeout => false,
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Unavailable(_) => !self.is_auth_error(),
            Self::Rejected { status, .. } => {
                (*status >= 500 || *status == 429) && !self.is_auth_error()
            }
            Self::InvalidResponse(_) => false,
        }
    }
}

fn mentions_auth_problem(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("not authenticated") || message.contains("jwt") || message.contains("permission")
}

/// Remote procedure surface answering privilege questions.
#[async_trait]
pub trait PrivilegeDirectory: Send + Sync {
    async fn is_admin(
        &self,
        user_id: &str,
        access_token: Option<&SecretString>,
    ) -> Result<bool, PrivilegeError>;

    async fn is_master_admin(
        &self,
        user_id: &str,
        access_token: Option<&SecretString>,
    ) -> Result<bool, PrivilegeError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdminConfig {
    pub cache_ttl: Duration,
    pub call_timeout: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

pub struct AdminRoleResolver {
    directory: Arc<dyn PrivilegeDirectory>,
    cache: Arc<dyn Store<AdminStatus>>,
    clock: Arc<dyn Clock>,
    logger: Arc<SecureLogger>,
    retry: RetryPolicy,
    config: AdminConfig,
}

impl fmt::Debug for AdminRoleResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminRoleResolver")
            .field("retry", &self.retry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AdminRoleResolver {
    pub fn new(
        directory: Arc<dyn PrivilegeDirectory>,
        cache: Arc<dyn Store<AdminStatus>>,
        clock: Arc<dyn Clock>,
        logger: Arc<SecureLogger>,
        retry: RetryPolicy,
        config: AdminConfig,
    ) -> Self {
        Self {
            directory,
            cache,
            clock,
            logger,
            retry,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    async fn cached(&self, user_id: &str) -> Option<AdminStatus> {
        match self.cache.get(user_id).await {
            Ok(Some(status)) => {
                let ttl_ms = i64::try_from(self.config.cache_ttl.as_millis()).unwrap_or(i64::MAX);
                (self.clock.now_ms() - status.resolved_at_ms < ttl_ms).then_some(status)
            }
            Ok(None) => None,
            Err(err) => {
                warn!("Admin cache read failed: {err}");
                None
            }
        }
    }

    /// One privilege question, retried and time-boxed per attempt.
    async fn ask<F, Fut>(&self, label: &str, call: F) -> Result<bool, PrivilegeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool, PrivilegeError>>,
    {
        let timeout = self.config.call_timeout;
        self.retry
            .run(
                label,
                |_| {
                    let fut = call();
                    async move {
                        tokio::time::timeout(timeout, fut)
                            .await
                            .unwrap_or(Err(PrivilegeError::Timeout))
                    }
                },
                PrivilegeError::is_transient,
            )
            .await
    }

    /// Resolve the admin tier of `user_id`. Never grants a tier on failure.
    pub async fn resolve(&self, session: Option<&Session>, user_id: &str) -> AdminResolution {
        if let Some(status) = self.cached(user_id).await {
            return AdminResolution {
                tier: status.tier,
                reason: ResolutionReason::Cached,
                error: None,
            };
        }

        let Some(session) = session else {
            return AdminResolution::denied(ResolutionReason::AuthRequired, None);
        };
        if session.user_id != user_id {
            self.logger.warning(
                "Admin resolution requested for a different user than the session",
                &[("user_id", user_id)],
            );
            return AdminResolution::denied(ResolutionReason::SessionMismatch, None);
        }
        let token = Some(&session.access_token);

        let is_admin = self
            .ask("is_admin", || self.directory.is_admin(user_id, token))
            .await;
        let tier = match is_admin {
            Ok(false) => AdminTier::None,
            Ok(true) => {
                match self
                    .ask("is_master_admin", || self.directory.is_master_admin(user_id, token))
                    .await
                {
                    Ok(true) => AdminTier::MasterAdmin,
                    Ok(false) => AdminTier::Admin,
                    Err(err) => {
                        self.logger.warning(
                            &format!("Master admin check failed, degrading to admin: {err}"),
                            &[("user_id", user_id)],
                        );
                        return AdminResolution {
                            tier: AdminTier::Admin,
                            reason: ResolutionReason::Resolved,
                            error: Some(err.to_string()),
                        };
                    }
                }
            }
            Err(err) if err.is_auth_error() => {
                return AdminResolution::denied(
                    ResolutionReason::AuthRequired,
                    Some(err.to_string()),
                );
            }
            Err(err) => {
                self.logger.error(
                    &format!("Admin check failed after retries: {err}"),
                    &[("user_id", user_id)],
                );
                return AdminResolution::denied(
                    ResolutionReason::Unavailable,
                    Some(err.to_string()),
                );
            }
        };

        let status = AdminStatus {
            user_id: user_id.to_string(),
            tier,
            resolved_at_ms: self.clock.now_ms(),
        };
        if let Err(err) = self.cache.set(user_id, status).await {
            warn!("Admin cache write failed: {err}");
        }
        AdminResolution {
            tier,
            reason: ResolutionReason::Resolved,
            error: None,
        }
    }

    /// Drop the cached status of `user_id`.
    pub async fn invalidate(&self, user_id: &str) {
        if let Err(err) = self.cache.delete(user_id).await {
            warn!("Admin cache invalidation failed: {err}");
        }
    }

    /// Drop cached statuses whenever a user signs in or out, so a new
    /// session never inherits the tier resolved for an old one.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<AuthEvent>,
    ) -> JoinHandle<()> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(
                        AuthEvent::SignedOut {
                            user_id: Some(user_id),
                        }
                        | AuthEvent::SignedIn { user_id },
                    ) => {
                        debug!("Invalidating admin cache after sign-in or sign-out");
                        resolver.invalidate(&user_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Auth event listener lagged, skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gateway::{
        clock::ManualClock,
        logger::LoggerSettings,
        retry::Backoff,
        session::tests::{session, NOW},
        store::MemoryStore,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Privilege directory answering from canned results.
    pub(crate) struct FakeDirectory {
        pub(crate) admin: Mutex<Result<bool, PrivilegeError>>,
        pub(crate) master: Mutex<Result<bool, PrivilegeError>>,
        pub(crate) admin_calls: AtomicU32,
        pub(crate) master_calls: AtomicU32,
        pub(crate) delay: Duration,
    }

    impl FakeDirectory {
        pub(crate) fn new(admin: Result<bool, PrivilegeError>, master: Result<bool, PrivilegeError>) -> Self {
            Self {
                admin: Mutex::new(admin),
                master: Mutex::new(master),
                admin_calls: AtomicU32::new(0),
                master_calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn answer(slot: &Mutex<Result<bool, PrivilegeError>>) -> Result<bool, PrivilegeError> {
            slot.lock()
                .map_err(|_| PrivilegeError::Unavailable("poisoned".to_string()))?
                .clone()
        }
    }

    #[async_trait]
    impl PrivilegeDirectory for FakeDirectory {
        async fn is_admin(
            &self,
            _user_id: &str,
            _token: Option<&SecretString>,
        ) -> Result<bool, PrivilegeError> {
            self.admin_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Self::answer(&self.admin)
        }

        async fn is_master_admin(
            &self,
            _user_id: &str,
            _token: Option<&SecretString>,
        ) -> Result<bool, PrivilegeError> {
            self.master_calls.fetch_add(1, Ordering::SeqCst);
            Self::answer(&self.master)
        }
    }

    const MINUTE_MS: i64 = 60 * 1000;

    fn resolver(
        directory: Arc<FakeDirectory>,
        config: AdminConfig,
    ) -> (Arc<AdminRoleResolver>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let logger = Arc::new(SecureLogger::new(
            LoggerSettings::default(),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        ));
        let resolver = AdminRoleResolver::new(
            directory,
            Arc::new(MemoryStore::new()),
            clock.clone(),
            logger,
            RetryPolicy::new(3, Duration::ZERO, Backoff::Linear),
            config,
        );
        (Arc::new(resolver), clock)
    }

    fn user_session() -> Session {
        session("u1", NOW, NOW + 60 * MINUTE_MS)
    }

    #[tokio::test]
    async fn master_admin_is_admin() {
        let directory = Arc::new(FakeDirectory::new(Ok(true), Ok(true)));
        let (resolver, _) = resolver(directory, AdminConfig::default());
        let resolution = resolver.resolve(Some(&user_session()), "u1").await;
        assert_eq!(resolution.tier, AdminTier::MasterAdmin);
        assert!(resolution.is_admin());
        assert!(resolution.is_master_admin());
    }

    #[tokio::test]
    async fn master_check_skipped_for_non_admins() {
        let directory = Arc::new(FakeDirectory::new(Ok(false), Ok(true)));
        let (resolver, _) = resolver(directory.clone(), AdminConfig::default());
        let resolution = resolver.resolve(Some(&user_session()), "u1").await;
        assert_eq!(resolution.tier, AdminTier::None);
        assert_eq!(directory.master_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_closed() {
        let directory = Arc::new(FakeDirectory::new(
            Err(PrivilegeError::Unavailable("connection reset".to_string())),
            Ok(true),
        ));
        let (resolver, _) = resolver(directory.clone(), AdminConfig::default());
        let resolution = resolver.resolve(Some(&user_session()), "u1").await;
        assert_eq!(resolution.tier, AdminTier::None);
        assert_eq!(resolution.reason, ResolutionReason::Unavailable);
        assert!(resolution.error.is_some());
        assert_eq!(directory.admin_calls.load(Ordering::SeqCst), 3);

        // Failures are not cached.
        let again = resolver.resolve(Some(&user_session()), "u1").await;
        assert_eq!(again.reason, ResolutionReason::Unavailable);
        assert_eq!(directory.admin_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let directory = Arc::new(FakeDirectory::new(
            Err(PrivilegeError::Rejected {
                status: 400,
                message: "JWT expired".to_string(),
            }),
            Ok(false),
        ));
        let (resolver, _) = resolver(directory.clone(), AdminConfig::default());
        let resolution = resolver.resolve(Some(&user_session()), "u1").await;
        assert_eq!(resolution.reason, ResolutionReason::AuthRequired);
        assert_eq!(resolution.tier, AdminTier::None);
        assert_eq!(directory.admin_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let mut directory = FakeDirectory::new(Ok(true), Ok(true));
        directory.delay = Duration::from_millis(200);
        let directory = Arc::new(directory);
        let config = AdminConfig {
            call_timeout: Duration::from_millis(10),
            ..AdminConfig::default()
        };
        let (resolver, _) = resolver(directory.clone(), config);
        let resolution = resolver.resolve(Some(&user_session()), "u1").await;
        assert_eq!(resolution.tier, AdminTier::None);
        assert_eq!(resolution.reason, ResolutionReason::Unavailable);
        assert_eq!(directory.admin_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn master_failure_degrades_to_admin() {
        let directory = Arc::new(FakeDirectory::new(
            Ok(true),
            Err(PrivilegeError::Unavailable("down".to_string())),
        ));
        let (resolver, _) = resolver(directory, AdminConfig::default());
        let resolution = resolver.resolve(Some(&user_session()), "u1").await;
        assert_eq!(resolution.tier, AdminTier::Admin);
        assert!(resolution.error.is_some());
    }

    #[tokio::test]
    async fn mismatched_session_fails_closed() {
        let directory = Arc::new(FakeDirectory::new(Ok(true), Ok(true)));
        let (resolver, _) = resolver(directory.clone(), AdminConfig::default());
        let other = session("u2", NOW, NOW + 60 * MINUTE_MS);
        let resolution = resolver.resolve(Some(&other), "u1").await;
        assert_eq!(resolution.reason, ResolutionReason::SessionMismatch);
        assert_eq!(resolution.tier, AdminTier::None);

        let resolution = resolver.resolve(None, "u1").await;
        assert_eq!(resolution.reason, ResolutionReason::AuthRequired);
        assert_eq!(directory.admin_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_respects_ttl() {
        let directory = Arc::new(FakeDirectory::new(Ok(true), Ok(false)));
        let (resolver, clock) = resolver(directory.clone(), AdminConfig::default());
        let session = user_session();

        assert_eq!(
            resolver.resolve(Some(&session), "u1").await.reason,
            ResolutionReason::Resolved
        );

        clock.advance_ms(2 * MINUTE_MS);
        let cached = resolver.resolve(Some(&session), "u1").await;
        assert_eq!(cached.reason, ResolutionReason::Cached);
        assert_eq!(cached.tier, AdminTier::Admin);
        assert_eq!(directory.admin_calls.load(Ordering::SeqCst), 1);

        clock.advance_ms(4 * MINUTE_MS);
        let refreshed = resolver.resolve(Some(&session), "u1").await;
        assert_eq!(refreshed.reason, ResolutionReason::Resolved);
        assert_eq!(directory.admin_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sign_out_event_invalidates_cache() -> anyhow::Result<()> {
        let directory = Arc::new(FakeDirectory::new(Ok(true), Ok(false)));
        let (resolver, _) = resolver(directory.clone(), AdminConfig::default());
        let (sender, receiver) = broadcast::channel(8);
        let listener = resolver.spawn_invalidation_listener(receiver);

        resolver.resolve(Some(&user_session()), "u1").await;
        sender.send(AuthEvent::SignedOut {
            user_id: Some("u1".to_string()),
        })?;
        drop(sender);
        listener.await?;

        assert_eq!(
            resolver.resolve(Some(&user_session()), "u1").await.reason,
            ResolutionReason::Resolved
        );
        assert_eq!(directory.admin_calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn sign_in_event_invalidates_cache() -> anyhow::Result<()> {
        let directory = Arc::new(FakeDirectory::new(Ok(true), Ok(false)));
        let (resolver, _) = resolver(directory.clone(), AdminConfig::default());
        let (sender, receiver) = broadcast::channel(8);
        let listener = resolver.spawn_invalidation_listener(receiver);

        resolver.resolve(Some(&user_session()), "u1").await;
        sender.send(AuthEvent::TokenRefreshed {
            user_id: "u1".to_string(),
        })?;
        sender.send(AuthEvent::SignedIn {
            user_id: "u1".to_string(),
        })?;
        drop(sender);
        listener.await?;

        resolver.resolve(Some(&user_session()), "u1").await;
        assert_eq!(directory.admin_calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn error_classification() {
        assert!(PrivilegeError::Rejected {
            status: 401,
            message: String::new()
        }
        .is_auth_error());
        assert!(PrivilegeError::Unavailable("user not authenticated".to_string()).is_auth_error());
        assert!(!PrivilegeError::Unavailable("user not authenticated".to_string()).is_transient());
        assert!(PrivilegeError::Timeout.is_transient());
        assert!(PrivilegeError::Rejected {
            status: 503,
            message: "upstream".to_string()
        }
        .is_transient());
        assert!(!PrivilegeError::Rejected {
            status: 400,
            message: "permission denied for function is_admin".to_string()
        }
        .is_transient());
    }

    #[test]
    fn tier_ordering() {
        assert!(!AdminTier::None.is_admin());
        assert!(AdminTier::Admin.is_admin());
        assert!(!AdminTier::Admin.is_master_admin());
        assert!(AdminTier::MasterAdmin.is_admin());
    }
}
