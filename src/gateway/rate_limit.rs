//! Sliding-window limiter for failed authentication attempts.
//!
//! Flow Overview:
//! 1) Every login/verification attempt is appended to a bounded per-identifier
//!    history (last 20 entries).
//! 2) `check_limit` drops entries older than the larger of the counting window
//!    and the block duration, then denies when the failures inside the window
//!    reach `max_attempts`, or when such a burst happened less than
//!    `block_duration` ago.
//! 3) `reset` clears the history after a successful authentication.
//!
//! Store failures deny the check (fail closed).

use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

use super::{
    clock::Clock,
    logger::{SecureLogger, ViolationKind},
    store::Store,
};

pub const MAX_TRACKED_ATTEMPTS: usize = 20;

const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);
const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAttempt {
    pub identifier: String,
    pub timestamp_ms: i64,
    pub success: bool,
    pub masked_email: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

impl RateLimitConfig {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            window: DEFAULT_WINDOW,
            block_duration: DEFAULT_BLOCK_DURATION,
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = block_duration;
        self
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Decide whether `attempts` (oldest first) block the identifier at `now_ms`.
fn is_blocked(attempts: &[AuthAttempt], now_ms: i64, config: &RateLimitConfig) -> bool {
    let max = usize::try_from(config.max_attempts.max(1)).unwrap_or(usize::MAX);
    let window_ms = duration_ms(config.window);
    let block_ms = duration_ms(config.block_duration);

    let failures: Vec<i64> = attempts
        .iter()
        .filter(|attempt| !attempt.success)
        .map(|attempt| attempt.timestamp_ms)
        .collect();

    let recent = failures
        .iter()
        .filter(|&&at| now_ms - at <= window_ms)
        .count();
    if recent >= max {
        return true;
    }

    // Latest moment `max` failures fitted inside one window.
    let tripped_at = (max - 1..failures.len())
        .filter(|&i| failures[i] - failures[i + 1 - max] <= window_ms)
        .map(|i| failures[i])
        .max();

    tripped_at.is_some_and(|at| now_ms - at < block_ms)
}

pub struct RateLimiter {
    name: &'static str,
    config: RateLimitConfig,
    store: Arc<dyn Store<Vec<AuthAttempt>>>,
    clock: Arc<dyn Clock>,
    logger: Arc<SecureLogger>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(
        name: &'static str,
        config: RateLimitConfig,
        store: Arc<dyn Store<Vec<AuthAttempt>>>,
        clock: Arc<dyn Clock>,
        logger: Arc<SecureLogger>,
    ) -> Self {
        Self {
            name,
            config,
            store,
            clock,
            logger,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Returns `false` when the identifier is currently blocked.
    pub async fn check_limit(&self, identifier: &str) -> bool {
        let now = self.clock.now_ms();
        let retain_ms = duration_ms(self.config.window.max(self.config.block_duration));

        let history = self
            .store
            .update(
                identifier,
                Box::new(move |current| {
                    let mut attempts = current?;
                    attempts.retain(|attempt| now - attempt.timestamp_ms <= retain_ms);
                    if attempts.is_empty() {
                        None
                    } else {
                        Some(attempts)
                    }
                }),
            )
            .await;

        let attempts = match history {
            Ok(attempts) => attempts.unwrap_or_default(),
            Err(err) => {
                self.logger.error(
                    &format!("{} rate limiter unavailable, denying: {err}", self.name),
                    &[("identifier", identifier)],
                );
                return false;
            }
        };

        if is_blocked(&attempts, now, &self.config) {
            let failures = attempts.iter().filter(|attempt| !attempt.success).count();
            self.logger
                .security_violation(
                    ViolationKind::RateLimit,
                    identifier,
                    &format!(
                        "{} limit reached: {failures} failed attempts (max {})",
                        self.name, self.config.max_attempts
                    ),
                )
                .await;
            return false;
        }

        true
    }

    /// Append an attempt to the identifier's history, keeping the last
    /// [`MAX_TRACKED_ATTEMPTS`] entries in call order.
    pub async fn record_attempt(&self, identifier: &str, success: bool, masked_email: Option<String>) {
        let attempt = AuthAttempt {
            identifier: identifier.to_string(),
            timestamp_ms: self.clock.now_ms(),
            success,
            masked_email,
        };
        let result = self
            .store
            .update(
                identifier,
                Box::new(move |current| {
                    let mut attempts = current.unwrap_or_default();
                    attempts.push(attempt);
                    if attempts.len() > MAX_TRACKED_ATTEMPTS {
                        let excess = attempts.len() - MAX_TRACKED_ATTEMPTS;
                        attempts.drain(..excess);
                    }
                    Some(attempts)
                }),
            )
            .await;
        if let Err(err) = result {
            self.logger.error(
                &format!("Failed to record {} attempt: {err}", self.name),
                &[("identifier", identifier)],
            );
        }
    }

    /// Forget every attempt for the identifier.
    pub async fn reset(&self, identifier: &str) {
        if let Err(err) = self.store.delete(identifier).await {
            self.logger.error(
                &format!("Failed to reset {} attempts: {err}", self.name),
                &[("identifier", identifier)],
            );
        }
    }

    /// Tracked attempts for the identifier, oldest first.
    pub async fn history(&self, identifier: &str) -> Vec<AuthAttempt> {
        self.store
            .get(identifier)
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}
