//! Immutable gateway configuration, validated once at startup.

use secrecy::{ExposeSecret, SecretString};
use std::{fmt, str::FromStr, time::Duration};
use url::Url;

use super::{
    admin::AdminConfig,
    csrf,
    headers::{SecurityHeaders, DEFAULT_CONTENT_SECURITY_POLICY},
    logger::{LogVerbosity, LoggerSettings},
    rate_limit::RateLimitConfig,
    retry::RetryPolicy,
    routes::RouteTable,
    session::SessionConfig,
};

const MIN_CSRF_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid route configuration: {0}")]
    InvalidRoute(String),
    #[error("redirect target must be a relative in-site path: {0}")]
    InvalidRedirect(String),
    #[error("CSRF secret must be at least {MIN_CSRF_SECRET_LEN} bytes")]
    WeakSecret,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        *self == Self::Production
    }

    fn ip_limit(self) -> u32 {
        match self {
            Self::Development => 100,
            Self::Staging | Self::Production => 10,
        }
    }

    fn account_limit(self) -> u32 {
        match self {
            Self::Development => 20,
            Self::Staging | Self::Production => 5,
        }
    }

    fn logger_settings(self) -> LoggerSettings {
        match self {
            Self::Development => LoggerSettings {
                verbosity: LogVerbosity::Detailed,
                include_ip: true,
                include_sensitive: false,
            },
            Self::Staging => LoggerSettings::default(),
            Self::Production => LoggerSettings {
                verbosity: LogVerbosity::Standard,
                include_ip: false,
                include_sensitive: false,
            },
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::Invalid(format!("unknown environment: {other}"))),
        }
    }
}

/// Remote service location plus the API key it expects.
#[derive(Clone, Debug)]
pub struct ServiceEndpoint {
    pub url: Url,
    pub api_key: SecretString,
}

impl ServiceEndpoint {
    #[must_use]
    pub fn new(url: Url, api_key: SecretString) -> Self {
        Self { url, api_key }
    }
}

/// Redirect destinations used by access decisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedirectTargets {
    pub login: String,
    pub unauthorized: String,
    pub maintenance: String,
    pub home: String,
}

impl Default for RedirectTargets {
    fn default() -> Self {
        Self {
            login: "/login".to_string(),
            unauthorized: "/".to_string(),
            maintenance: "/maintenance".to_string(),
            home: "/".to_string(),
        }
    }
}

/// A redirect target must stay on this site.
fn validate_redirect(target: &str) -> Result<(), ConfigError> {
    let relative = target.starts_with('/')
        && !target.starts_with("//")
        && !target.contains('\\')
        && !target.chars().any(char::is_control);
    if relative {
        Ok(())
    } else {
        Err(ConfigError::InvalidRedirect(target.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    environment: Environment,
    upstream_url: Url,
    identity: ServiceEndpoint,
    privilege: ServiceEndpoint,
    csrf_secret: SecretString,
    csrf_max_age: Duration,
    routes: RouteTable,
    login_endpoints: Vec<String>,
    redirects: RedirectTargets,
    maintenance: bool,
    ip_limit: RateLimitConfig,
    account_limit: RateLimitConfig,
    session: SessionConfig,
    admin: AdminConfig,
    retry: RetryPolicy,
    logger: LoggerSettings,
    content_security_policy: String,
    hsts: bool,
    secure_cookies: bool,
    trust_forwarded_for: bool,
    store_dsn: Option<SecretString>,
    identity_timeout: Duration,
}

impl GatewayConfig {
    /// Defaults follow `environment`; override with the `with_*` methods and
    /// call [`GatewayConfig::validate`] before use.
    #[must_use]
    pub fn new(
        environment: Environment,
        upstream_url: Url,
        identity: ServiceEndpoint,
        privilege: ServiceEndpoint,
        csrf_secret: SecretString,
    ) -> Self {
        let strict = environment != Environment::Development;
        Self {
            environment,
            upstream_url,
            identity,
            privilege,
            csrf_secret,
            csrf_max_age: csrf::DEFAULT_MAX_AGE,
            routes: RouteTable::default(),
            login_endpoints: vec!["/login".to_string(), "/api/auth/login".to_string()],
            redirects: RedirectTargets::default(),
            maintenance: false,
            ip_limit: RateLimitConfig::new(environment.ip_limit()),
            account_limit: RateLimitConfig::new(environment.account_limit()),
            session: SessionConfig::default(),
            admin: AdminConfig::default(),
            retry: RetryPolicy::default(),
            logger: environment.logger_settings(),
            content_security_policy: DEFAULT_CONTENT_SECURITY_POLICY.to_string(),
            hsts: environment.is_production(),
            secure_cookies: strict,
            trust_forwarded_for: false,
            store_dsn: None,
            identity_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    #[must_use]
    pub fn with_login_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.login_endpoints = endpoints;
        self
    }

    #[must_use]
    pub fn with_redirects(mut self, redirects: RedirectTargets) -> Self {
        self.redirects = redirects;
        self
    }

    #[must_use]
    pub fn with_maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = maintenance;
        self
    }

    #[must_use]
    pub fn with_ip_limit(mut self, limit: RateLimitConfig) -> Self {
        self.ip_limit = limit;
        self
    }

    #[must_use]
    pub fn with_account_limit(mut self, limit: RateLimitConfig) -> Self {
        self.account_limit = limit;
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    #[must_use]
    pub fn with_admin(mut self, admin: AdminConfig) -> Self {
        self.admin = admin;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_csrf_max_age(mut self, max_age: Duration) -> Self {
        self.csrf_max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: LoggerSettings) -> Self {
        self.logger = logger;
        self
    }

    #[must_use]
    pub fn with_content_security_policy(mut self, policy: String) -> Self {
        self.content_security_policy = policy;
        self
    }

    #[must_use]
    pub fn with_hsts(mut self, hsts: bool) -> Self {
        self.hsts = hsts;
        self
    }

    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    #[must_use]
    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    #[must_use]
    pub fn with_store_dsn(mut self, dsn: Option<SecretString>) -> Self {
        self.store_dsn = dsn;
        self
    }

    #[must_use]
    pub fn with_identity_timeout(mut self, timeout: Duration) -> Self {
        self.identity_timeout = timeout;
        self
    }

    /// Check every cross-field rule.
    ///
    /// # Errors
    /// Returns the first rule that does not hold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.csrf_secret.expose_secret().len() < MIN_CSRF_SECRET_LEN {
            return Err(ConfigError::WeakSecret);
        }
        for target in [
            &self.redirects.login,
            &self.redirects.unauthorized,
            &self.redirects.maintenance,
            &self.redirects.home,
        ] {
            validate_redirect(target)?;
        }
        for endpoint in &self.login_endpoints {
            if !endpoint.starts_with('/') {
                return Err(ConfigError::InvalidRoute(format!(
                    "login endpoint must start with '/': {endpoint}"
                )));
            }
        }
        if self.routes.classify(&self.redirects.login).requires_session() {
            return Err(ConfigError::InvalidRoute(format!(
                "login page {} must not require a session",
                self.redirects.login
            )));
        }
        if self.ip_limit.max_attempts == 0 || self.account_limit.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "rate limit max attempts must be positive".to_string(),
            ));
        }
        if self.session.refresh_threshold >= self.session.max_age {
            return Err(ConfigError::Invalid(
                "session refresh threshold must be shorter than the max age".to_string(),
            ));
        }
        if self.admin.call_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "privilege call timeout must be positive".to_string(),
            ));
        }
        SecurityHeaders::new(&self.content_security_policy, self.hsts)?;
        Ok(())
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }

    #[must_use]
    pub fn upstream_url(&self) -> &Url {
        &self.upstream_url
    }

    #[must_use]
    pub fn identity(&self) -> &ServiceEndpoint {
        &self.identity
    }

    #[must_use]
    pub fn privilege(&self) -> &ServiceEndpoint {
        &self.privilege
    }

    #[must_use]
    pub fn csrf_secret(&self) -> &SecretString {
        &self.csrf_secret
    }

    #[must_use]
    pub fn csrf_max_age(&self) -> Duration {
        self.csrf_max_age
    }

    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    #[must_use]
    pub fn login_endpoints(&self) -> &[String] {
        &self.login_endpoints
    }

    /// Exact, ASCII case-insensitive match on a configured login endpoint.
    #[must_use]
    pub fn is_login_endpoint(&self, path: &str) -> bool {
        let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };
        self.login_endpoints
            .iter()
            .any(|endpoint| endpoint.eq_ignore_ascii_case(path))
    }

    #[must_use]
    pub fn redirects(&self) -> &RedirectTargets {
        &self.redirects
    }

    #[must_use]
    pub fn maintenance(&self) -> bool {
        self.maintenance
    }

    #[must_use]
    pub fn ip_limit(&self) -> &RateLimitConfig {
        &self.ip_limit
    }

    #[must_use]
    pub fn account_limit(&self) -> &RateLimitConfig {
        &self.account_limit
    }

    #[must_use]
    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    #[must_use]
    pub fn admin(&self) -> &AdminConfig {
        &self.admin
    }

    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn logger(&self) -> &LoggerSettings {
        &self.logger
    }

    #[must_use]
    pub fn content_security_policy(&self) -> &str {
        &self.content_security_policy
    }

    #[must_use]
    pub fn hsts(&self) -> bool {
        self.hsts
    }

    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }

    #[must_use]
    pub fn trust_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
    }

    #[must_use]
    pub fn store_dsn(&self) -> Option<&SecretString> {
        self.store_dsn.as_ref()
    }

    #[must_use]
    pub fn identity_timeout(&self) -> Duration {
        self.identity_timeout
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_SECRET: &str = "0123456789abcdef0123456789abcdef";

    pub(crate) fn config(environment: Environment) -> GatewayConfig {
        let url = |u: &str| Url::parse(u).unwrap();
        GatewayConfig::new(
            environment,
            url("http://127.0.0.1:3000"),
            ServiceEndpoint::new(url("http://127.0.0.1:9999/auth/v1"), SecretString::from("anon")),
            ServiceEndpoint::new(url("http://127.0.0.1:9999/rest/v1"), SecretString::from("anon")),
            SecretString::from(TEST_SECRET),
        )
    }

    #[test]
    fn environment_defaults() {
        let production = config(Environment::Production);
        assert_eq!(production.ip_limit().max_attempts, 10);
        assert_eq!(production.account_limit().max_attempts, 5);
        assert!(production.hsts());
        assert!(production.secure_cookies());
        assert!(!production.logger().include_ip);

        let development = config(Environment::Development);
        assert!(!development.hsts());
        assert_eq!(development.logger().verbosity, LogVerbosity::Detailed);
    }

    #[test]
    fn parses_environment() {
        assert_eq!("prod".parse::<Environment>().ok(), Some(Environment::Production));
        assert_eq!(" Staging ".parse::<Environment>().ok(), Some(Environment::Staging));
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(config(Environment::Production).validate().is_ok());
    }

    #[test]
    fn short_secret_is_rejected() {
        let mut config = config(Environment::Production);
        config.csrf_secret = SecretString::from("short");
        assert!(matches!(config.validate(), Err(ConfigError::WeakSecret)));
    }

    #[test]
    fn absolute_redirects_are_rejected() {
        for target in ["https://evil.example/", "//evil.example", "login", "/\\evil"] {
            let config = config(Environment::Production).with_redirects(RedirectTargets {
                login: target.to_string(),
                ..RedirectTargets::default()
            });
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidRedirect(_))),
                "{target}"
            );
        }
    }

    #[test]
    fn protected_login_page_is_rejected() -> Result<(), ConfigError> {
        let routes = RouteTable::new(vec!["/login".to_string()], vec![], vec![])?;
        let config = config(Environment::Production).with_routes(routes);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRoute(_))));
        Ok(())
    }

    #[test]
    fn login_endpoint_matching() {
        let config = config(Environment::Production);
        assert!(config.is_login_endpoint("/login"));
        assert!(config.is_login_endpoint("/login/"));
        assert!(config.is_login_endpoint("/LOGIN"));
        assert!(!config.is_login_endpoint("/login/help"));
    }
}
