//! Component wiring shared by the server, the handlers and the tests.

use anyhow::{Context, Result};
use reqwest::Client;
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use super::{
    access::AccessController,
    admin::{AdminRoleResolver, AdminStatus, AdminStatusTracker, PrivilegeDirectory},
    clock::Clock,
    config::GatewayConfig,
    csrf::CsrfService,
    headers::SecurityHeaders,
    logger::{SecureLogger, SecurityViolation},
    rate_limit::{AuthAttempt, RateLimiter},
    session::{IdentityProvider, SessionValidator},
    store::{ensure_schema, MemoryStore, PgStore, Store},
};
use crate::APP_USER_AGENT;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const VIOLATION_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// How long an untouched entry can still change a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Retention {
    pub attempts: Duration,
    pub admin_status: Duration,
    pub violations: Duration,
}

impl Retention {
    /// Attempt histories outlive the longest window or block of either
    /// limiter; cached admin tiers outlive their TTL.
    #[must_use]
    pub fn for_config(config: &GatewayConfig) -> Self {
        let attempts = [config.ip_limit(), config.account_limit()]
            .iter()
            .flat_map(|limit| [limit.window, limit.block_duration])
            .max()
            .unwrap_or_default();
        Self {
            attempts,
            admin_status: config.admin().cache_ttl,
            violations: VIOLATION_RETENTION,
        }
    }
}

/// Backing stores for shared gateway state.
#[derive(Clone)]
pub struct Stores {
    pub attempts: Arc<dyn Store<Vec<AuthAttempt>>>,
    pub admin_status: Arc<dyn Store<AdminStatus>>,
    pub violations: Arc<dyn Store<Vec<SecurityViolation>>>,
}

impl Stores {
    /// Process-local stores. Only correct for a single gateway instance.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            attempts: Arc::new(MemoryStore::<Vec<AuthAttempt>>::new()),
            admin_status: Arc::new(MemoryStore::<AdminStatus>::new()),
            violations: Arc::new(MemoryStore::<Vec<SecurityViolation>>::new()),
        }
    }

    /// Stores shared through PostgreSQL.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub async fn postgres(pool: PgPool) -> Result<Self> {
        ensure_schema(&pool)
            .await
            .context("Failed to create gateway store schema")?;
        Ok(Self {
            attempts: Arc::new(PgStore::<Vec<AuthAttempt>>::new(pool.clone(), "auth_attempts")),
            admin_status: Arc::new(PgStore::<AdminStatus>::new(pool.clone(), "admin_status")),
            violations: Arc::new(PgStore::<Vec<SecurityViolation>>::new(pool, "security_violations")),
        })
    }

    /// Drop idle entries from every store and return how many went. Store
    /// errors are logged and skipped.
    pub async fn sweep(&self, retention: &Retention) -> u64 {
        let results = [
            ("auth_attempts", self.attempts.purge_idle(retention.attempts).await),
            ("admin_status", self.admin_status.purge_idle(retention.admin_status).await),
            ("security_violations", self.violations.purge_idle(retention.violations).await),
        ];
        let mut removed = 0;
        for (name, result) in results {
            match result {
                Ok(count) => removed += count,
                Err(err) => warn!("Failed to sweep {name} store: {err}"),
            }
        }
        removed
    }

    /// Sweep every `period` until the handle is aborted. The first sweep
    /// runs one period after start.
    pub fn spawn_sweeper(&self, retention: Retention, period: Duration) -> JoinHandle<()> {
        let stores = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = stores.sweep(&retention).await;
                if removed > 0 {
                    debug!("Swept {removed} idle store entries");
                }
            }
        })
    }
}

pub struct GatewayState {
    config: Arc<GatewayConfig>,
    clock: Arc<dyn Clock>,
    logger: Arc<SecureLogger>,
    ip_limiter: Arc<RateLimiter>,
    csrf: Arc<CsrfService>,
    sessions: Arc<SessionValidator>,
    admin: Arc<AdminRoleResolver>,
    tracker: AdminStatusTracker,
    access: AccessController,
    security_headers: SecurityHeaders,
    upstream: Client,
    sweeper: JoinHandle<()>,
}

impl Drop for GatewayState {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("environment", &self.config.environment())
            .finish_non_exhaustive()
    }
}

impl GatewayState {
    /// Validate the configuration and assemble every component.
    ///
    /// Must be called inside a Tokio runtime: the admin cache listener and
    /// the store sweeper are spawned here.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the upstream client
    /// cannot be built.
    pub fn new(
        config: GatewayConfig,
        identity: Arc<dyn IdentityProvider>,
        directory: Arc<dyn PrivilegeDirectory>,
        stores: Stores,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate().context("Invalid gateway configuration")?;
        let config = Arc::new(config);
        let retention = Retention::for_config(&config);

        let logger = Arc::new(SecureLogger::new(
            *config.logger(),
            stores.violations.clone(),
            clock.clone(),
        ));
        let ip_limiter = Arc::new(RateLimiter::new(
            "ip",
            *config.ip_limit(),
            stores.attempts.clone(),
            clock.clone(),
            logger.clone(),
        ));
        let account_limiter = Arc::new(RateLimiter::new(
            "account",
            *config.account_limit(),
            stores.attempts.clone(),
            clock.clone(),
            logger.clone(),
        ));
        let csrf = Arc::new(
            CsrfService::new(config.csrf_secret().clone(), clock.clone(), logger.clone())
                .with_max_age(config.csrf_max_age()),
        );
        let sessions = Arc::new(SessionValidator::new(
            identity,
            clock.clone(),
            logger.clone(),
            *config.session(),
            *config.retry(),
        ));
        let admin = Arc::new(AdminRoleResolver::new(
            directory,
            stores.admin_status.clone(),
            clock.clone(),
            logger.clone(),
            *config.retry(),
            *config.admin(),
        ));
        admin.spawn_invalidation_listener(sessions.subscribe());

        let tracker = AdminStatusTracker::new(admin.clone());
        let access = AccessController::new(
            config.clone(),
            ip_limiter.clone(),
            account_limiter,
            csrf.clone(),
            sessions.clone(),
            admin.clone(),
            logger.clone(),
        );
        let security_headers = SecurityHeaders::new(config.content_security_policy(), config.hsts())
            .context("Invalid security headers")?;
        let upstream = Client::builder()
            .user_agent(APP_USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build upstream client")?;

        if config.environment().is_production() && config.store_dsn().is_none() {
            warn!("Using in-process stores in production: rate limits and admin revocation are not shared between instances");
        }
        let sweeper = stores.spawn_sweeper(retention, SWEEP_INTERVAL);

        Ok(Self {
            config,
            clock,
            logger,
            ip_limiter,
            csrf,
            sessions,
            admin,
            tracker,
            access,
            security_headers,
            upstream,
            sweeper,
        })
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    #[must_use]
    pub fn logger(&self) -> &SecureLogger {
        &self.logger
    }

    #[must_use]
    pub fn ip_limiter(&self) -> &RateLimiter {
        &self.ip_limiter
    }

    #[must_use]
    pub fn csrf(&self) -> &CsrfService {
        &self.csrf
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionValidator {
        &self.sessions
    }

    #[must_use]
    pub fn admin(&self) -> &AdminRoleResolver {
        &self.admin
    }

    #[must_use]
    pub fn tracker(&self) -> &AdminStatusTracker {
        &self.tracker
    }

    #[must_use]
    pub fn access(&self) -> &AccessController {
        &self.access
    }

    #[must_use]
    pub fn security_headers(&self) -> &SecurityHeaders {
        &self.security_headers
    }

    #[must_use]
    pub fn upstream(&self) -> &Client {
        &self.upstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{
        clock::ManualClock,
        config::{tests::config, Environment},
        rate_limit::RateLimitConfig,
    };
    use anyhow::Result;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    fn stores(clock: &Arc<ManualClock>) -> Stores {
        Stores {
            attempts: Arc::new(MemoryStore::<Vec<AuthAttempt>>::with_clock(clock.clone())),
            admin_status: Arc::new(MemoryStore::<AdminStatus>::with_clock(clock.clone())),
            violations: Arc::new(MemoryStore::<Vec<SecurityViolation>>::with_clock(clock.clone())),
        }
    }

    #[test]
    fn retention_covers_longest_limit() {
        let config = config(Environment::Production)
            .with_ip_limit(RateLimitConfig::new(10).with_window(Duration::from_secs(600)))
            .with_account_limit(
                RateLimitConfig::new(5).with_block_duration(Duration::from_secs(7200)),
            );
        let retention = Retention::for_config(&config);
        assert_eq!(retention.attempts, Duration::from_secs(7200));
        assert_eq!(retention.admin_status, config.admin().cache_ttl);
        assert_eq!(retention.violations, VIOLATION_RETENTION);
    }

    #[tokio::test]
    async fn sweep_forgets_idle_identifiers() -> Result<()> {
        let clock = Arc::new(ManualClock::new(HOUR_MS));
        let stores = stores(&clock);
        let retention = Retention {
            attempts: Duration::from_secs(1800),
            admin_status: Duration::from_secs(300),
            violations: VIOLATION_RETENTION,
        };
        for i in 0..20 {
            stores.attempts.set(&format!("ip:198.51.100.{i}"), Vec::new()).await?;
        }
        stores.violations.set("ip:198.51.100.1", Vec::new()).await?;

        clock.advance_ms(HOUR_MS);
        stores.attempts.set("ip:203.0.113.7", Vec::new()).await?;

        assert_eq!(stores.sweep(&retention).await, 20);
        assert!(stores.attempts.get("ip:198.51.100.3").await?.is_none());
        assert!(stores.attempts.get("ip:203.0.113.7").await?.is_some());
        assert!(stores.violations.get("ip:198.51.100.1").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn sweeper_runs_periodically() -> Result<()> {
        let clock = Arc::new(ManualClock::new(0));
        let stores = stores(&clock);
        stores.attempts.set("ip:198.51.100.9", Vec::new()).await?;
        clock.advance_ms(HOUR_MS);

        let retention = Retention {
            attempts: Duration::from_secs(60),
            admin_status: Duration::from_secs(60),
            violations: Duration::from_secs(60),
        };
        let sweeper = stores.spawn_sweeper(retention, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(stores.attempts.get("ip:198.51.100.9").await?.is_none());
        sweeper.abort();
        Ok(())
    }
}
