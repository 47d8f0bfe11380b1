//! Route access controller.
//!
//! Flow Overview:
//! 1) Maintenance: everything except the maintenance page and static assets
//!    is redirected.
//! 2) Rate limit per IP, plus per IP and account on login endpoints (429).
//! 3) Session resolution with silent refresh. A terminal refresh error signs
//!    the user out and the request continues unauthenticated.
//! 4) Admin-only routes resolve the admin tier (login or unauthorized
//!    redirect).
//! 5) CSRF on state-changing methods (403).
//! 6) Protected routes need a session, public-only routes send signed-in
//!    users home.

use axum::http::{header::InvalidHeaderValue, HeaderMap, Method, Uri};
use std::sync::Arc;

use super::{
    admin::{AdminResolution, AdminRoleResolver, ResolutionReason},
    config::GatewayConfig,
    csrf::{is_state_changing, CsrfService},
    logger::{SecureLogger, ViolationKind},
    rate_limit::RateLimiter,
    routes::{is_static_asset, RouteClassification},
    session::{cookies::credentials_from_headers, Session, SessionReason, SessionValidator},
};

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("invalid header value: {0}")]
    Header(#[from] InvalidHeaderValue),
    #[error("failed to read request body: {0}")]
    Body(String),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Continue,
    /// 303 to a relative in-site path.
    Redirect(String),
    TooManyRequests,
    Forbidden,
}

/// Session cookies to write on the response.
#[derive(Clone, Debug, Default)]
pub enum CookieUpdate {
    #[default]
    Keep,
    Set(Session),
    Clear,
}

/// What the controller needs to know about a request.
#[derive(Debug)]
pub struct AccessRequest<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub client_ip: &'a str,
    /// Account named in a login request body.
    pub account: Option<&'a str>,
}

#[derive(Clone, Debug)]
pub struct AccessOutcome {
    pub decision: Decision,
    pub classification: RouteClassification,
    pub session: Option<Session>,
    pub admin: Option<AdminResolution>,
    pub cookies: CookieUpdate,
    pub ip_identifier: String,
    pub account_identifier: Option<String>,
}

impl AccessOutcome {
    fn new(ip_identifier: String, classification: RouteClassification) -> Self {
        Self {
            decision: Decision::Continue,
            classification,
            session: None,
            admin: None,
            cookies: CookieUpdate::Keep,
            ip_identifier,
            account_identifier: None,
        }
    }

    fn decide(mut self, decision: Decision) -> Self {
        self.decision = decision;
        self
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.user_id.as_str())
    }
}

/// Percent-encode a return path for a query value, keeping `/` readable.
fn encode_return_path(path: &str) -> String {
    path.split('/')
        .map(urlencoding::encode)
        .collect::<Vec<_>>()
        .join("/")
}

/// Original path and query, collapsed so it can never leave the site.
fn return_path(uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);
    format!("/{}", path_and_query.trim_start_matches(['/', '\\']))
}

#[must_use]
pub fn ip_identifier(ip: &str) -> String {
    format!("ip:{ip}")
}

#[must_use]
pub fn account_identifier(ip: &str, account: &str) -> String {
    format!("login:{ip}:{}", account.trim().to_lowercase())
}

pub struct AccessController {
    config: Arc<GatewayConfig>,
    ip_limiter: Arc<RateLimiter>,
    account_limiter: Arc<RateLimiter>,
    csrf: Arc<CsrfService>,
    sessions: Arc<SessionValidator>,
    admin: Arc<AdminRoleResolver>,
    logger: Arc<SecureLogger>,
}

impl std::fmt::Debug for AccessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessController").finish_non_exhaustive()
    }
}

impl AccessController {
    pub fn new(
        config: Arc<GatewayConfig>,
        ip_limiter: Arc<RateLimiter>,
        account_limiter: Arc<RateLimiter>,
        csrf: Arc<CsrfService>,
        sessions: Arc<SessionValidator>,
        admin: Arc<AdminRoleResolver>,
        logger: Arc<SecureLogger>,
    ) -> Self {
        Self {
            config,
            ip_limiter,
            account_limiter,
            csrf,
            sessions,
            admin,
            logger,
        }
    }

    fn login_redirect(&self, uri: &Uri) -> Decision {
        Decision::Redirect(format!(
            "{}?redirect={}",
            self.config.redirects().login,
            encode_return_path(&return_path(uri))
        ))
    }

    /// Run the access pipeline for one request.
    pub async fn evaluate(&self, request: &AccessRequest<'_>) -> AccessOutcome {
        let path = request.uri.path();
        let classification = self.config.routes().classify(path);
        let mut outcome = AccessOutcome::new(ip_identifier(request.client_ip), classification);
        let redirects = self.config.redirects();

        if self.config.maintenance() && path != redirects.maintenance && !is_static_asset(path) {
            return outcome.decide(Decision::Redirect(redirects.maintenance.clone()));
        }

        if !self.ip_limiter.check_limit(&outcome.ip_identifier).await {
            return outcome.decide(Decision::TooManyRequests);
        }
        if self.config.is_login_endpoint(path) {
            if let Some(account) = request.account.filter(|account| !account.trim().is_empty()) {
                let identifier = account_identifier(request.client_ip, account);
                if !self.account_limiter.check_limit(&identifier).await {
                    return outcome.decide(Decision::TooManyRequests);
                }
                outcome.account_identifier = Some(identifier);
            }
        }

        let credentials = credentials_from_headers(request.headers);
        if !credentials.is_empty() {
            let check = self.sessions.refresh_session_if_needed(&credentials).await;
            if check.terminal {
                self.logger
                    .security_violation(
                        ViolationKind::InvalidSession,
                        &outcome.ip_identifier,
                        "refresh token rejected, session cleared",
                    )
                    .await;
                outcome.cookies = CookieUpdate::Clear;
            } else if check.is_valid {
                if check.reason == SessionReason::Refreshed {
                    if let Some(session) = &check.session {
                        outcome.cookies = CookieUpdate::Set(session.clone());
                    }
                }
                outcome.session = check.session;
            }
        }

        if classification.admin_only {
            let Some(session) = outcome.session.clone() else {
                return outcome.decide(self.login_redirect(request.uri));
            };
            let resolution = self.admin.resolve(Some(&session), &session.user_id).await;
            let decision = match resolution.reason {
                ResolutionReason::AuthRequired => Some(self.login_redirect(request.uri)),
                ResolutionReason::SessionMismatch => {
                    self.logger
                        .security_violation(
                            ViolationKind::SuspiciousActivity,
                            &outcome.ip_identifier,
                            "admin resolution for a session owned by another user",
                        )
                        .await;
                    Some(Decision::Redirect(redirects.unauthorized.clone()))
                }
                _ if !resolution.is_admin() => {
                    self.logger.info(
                        "Non-admin denied admin route",
                        &[("user_id", session.user_id.as_str()), ("path", path)],
                    );
                    Some(Decision::Redirect(redirects.unauthorized.clone()))
                }
                _ => None,
            };
            outcome.admin = Some(resolution);
            if let Some(decision) = decision {
                return outcome.decide(decision);
            }
        }

        if is_state_changing(request.method)
            && !self
                .csrf
                .validate_request(
                    request.method,
                    request.headers,
                    request.uri,
                    outcome.user_id(),
                    &outcome.ip_identifier,
                )
                .await
        {
            return outcome.decide(Decision::Forbidden);
        }

        if classification.requires_session() && outcome.session.is_none() {
            return outcome.decide(self.login_redirect(request.uri));
        }
        if classification.public_only && outcome.session.is_some() {
            return outcome.decide(Decision::Redirect(redirects.home.clone()));
        }
        outcome
    }

    /// Account for a login attempt once the upstream answered. Success clears
    /// both limiters for the caller.
    pub async fn record_login_result(&self, outcome: &AccessOutcome, success: bool, masked_email: Option<String>) {
        self.ip_limiter
            .record_attempt(&outcome.ip_identifier, success, masked_email.clone())
            .await;
        if let Some(identifier) = &outcome.account_identifier {
            self.account_limiter
                .record_attempt(identifier, success, masked_email)
                .await;
        }
        if success {
            self.ip_limiter.reset(&outcome.ip_identifier).await;
            if let Some(identifier) = &outcome.account_identifier {
                self.account_limiter.reset(identifier).await;
            }
        }
    }
}
