use crate::{
    cli::telemetry,
    gateway::{
        self,
        config::{Environment, GatewayConfig, RedirectTargets, ServiceEndpoint},
        logger::LogVerbosity,
        routes::RouteTable,
    },
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub environment: Environment,
    pub upstream_url: Url,
    pub identity_url: Url,
    pub identity_api_key: SecretString,
    pub privilege_url: Url,
    pub privilege_api_key: SecretString,
    pub csrf_secret: SecretString,
    pub dsn: Option<SecretString>,
    pub protected_routes: Vec<String>,
    pub admin_routes: Vec<String>,
    pub public_routes: Vec<String>,
    pub login_endpoints: Vec<String>,
    pub redirects: RedirectTargets,
    pub maintenance: bool,
    pub ip_limit: Option<u32>,
    pub account_limit: Option<u32>,
    pub limit_window: Option<Duration>,
    pub block_duration: Option<Duration>,
    pub trust_forwarded_for: bool,
    pub csrf_max_age: Option<Duration>,
    pub refresh_threshold: Option<Duration>,
    pub admin_cache_ttl: Option<Duration>,
    pub privilege_timeout: Option<Duration>,
    pub identity_timeout: Option<Duration>,
    pub secure_cookies: Option<bool>,
    pub hsts: Option<bool>,
    pub content_security_policy: Option<String>,
    pub log_detail: Option<LogVerbosity>,
    pub log_include_ip: Option<bool>,
}

impl Args {
    /// Environment defaults first, then every option that was given.
    ///
    /// # Errors
    /// Returns an error if the resulting configuration does not validate.
    pub fn into_config(self) -> Result<GatewayConfig> {
        let routes = RouteTable::new(self.protected_routes, self.admin_routes, self.public_routes)?;
        let mut config = GatewayConfig::new(
            self.environment,
            self.upstream_url,
            ServiceEndpoint::new(self.identity_url, self.identity_api_key),
            ServiceEndpoint::new(self.privilege_url, self.privilege_api_key),
            self.csrf_secret,
        )
        .with_routes(routes)
        .with_login_endpoints(self.login_endpoints)
        .with_redirects(self.redirects)
        .with_maintenance(self.maintenance)
        .with_trust_forwarded_for(self.trust_forwarded_for)
        .with_store_dsn(self.dsn);

        let mut ip_limit = *config.ip_limit();
        let mut account_limit = *config.account_limit();
        if let Some(max_attempts) = self.ip_limit {
            ip_limit.max_attempts = max_attempts;
        }
        if let Some(max_attempts) = self.account_limit {
            account_limit.max_attempts = max_attempts;
        }
        for limit in [&mut ip_limit, &mut account_limit] {
            if let Some(window) = self.limit_window {
                limit.window = window;
            }
            if let Some(block_duration) = self.block_duration {
                limit.block_duration = block_duration;
            }
        }
        config = config
            .with_ip_limit(ip_limit)
            .with_account_limit(account_limit);

        let mut session = *config.session();
        if let Some(threshold) = self.refresh_threshold {
            session.refresh_threshold = threshold;
        }
        let mut admin = *config.admin();
        if let Some(ttl) = self.admin_cache_ttl {
            admin.cache_ttl = ttl;
        }
        if let Some(timeout) = self.privilege_timeout {
            admin.call_timeout = timeout;
        }
        let mut logger = *config.logger();
        if let Some(verbosity) = self.log_detail {
            logger.verbosity = verbosity;
        }
        if let Some(include_ip) = self.log_include_ip {
            logger.include_ip = include_ip;
        }
        config = config
            .with_session(session)
            .with_admin(admin)
            .with_logger(logger);

        if let Some(max_age) = self.csrf_max_age {
            config = config.with_csrf_max_age(max_age);
        }
        if let Some(timeout) = self.identity_timeout {
            config = config.with_identity_timeout(timeout);
        }
        if let Some(secure) = self.secure_cookies {
            config = config.with_secure_cookies(secure);
        }
        if let Some(hsts) = self.hsts {
            config = config.with_hsts(hsts);
        }
        if let Some(policy) = self.content_security_policy {
            config = config.with_content_security_policy(policy);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is invalid or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let port = args.port;
    let config = args.into_config().context("Invalid gateway configuration")?;
    log_startup(port, &config);

    let result = gateway::new(port, config).await;
    telemetry::shutdown_tracer();
    result
}

fn log_startup(port: u16, config: &GatewayConfig) {
    let routes = config.routes();
    let entries = [
        ("listen", format!("tcp:{port}")),
        ("environment", config.environment().to_string()),
        ("upstream", config.upstream_url().to_string()),
        ("identity", config.identity().url.to_string()),
        ("privilege", config.privilege().url.to_string()),
        (
            "store",
            config
                .store_dsn()
                .map_or_else(|| "memory".to_string(), |dsn| redact_dsn(dsn.expose_secret())),
        ),
        ("protected", routes.protected().join(",")),
        ("admin_only", routes.admin_only().join(",")),
        ("public_only", routes.public_only().join(",")),
        (
            "ip_limit",
            format!(
                "{} per {}s",
                config.ip_limit().max_attempts,
                config.ip_limit().window.as_secs()
            ),
        ),
        ("account_limit", config.account_limit().max_attempts.to_string()),
        ("maintenance", config.maintenance().to_string()),
        ("hsts", config.hsts().to_string()),
    ];

    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "storegate {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
