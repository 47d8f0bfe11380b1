use crate::{
    cli::actions::{server::Args, Action},
    gateway::config::{Environment, RedirectTargets},
};
use anyhow::{Context, Result};
use clap::ArgMatches;
use secrecy::SecretString;
use std::time::Duration;
use url::Url;

fn string(matches: &ArgMatches, id: &str) -> Result<String> {
    matches
        .get_one::<String>(id)
        .cloned()
        .with_context(|| format!("missing required argument: --{id}"))
}

fn url(matches: &ArgMatches, id: &str) -> Result<Url> {
    let raw = string(matches, id)?;
    Url::parse(&raw).with_context(|| format!("invalid URL for --{id}: {raw}"))
}

fn secret(matches: &ArgMatches, id: &str) -> Result<SecretString> {
    string(matches, id).map(SecretString::from)
}

fn list(matches: &ArgMatches, id: &str) -> Vec<String> {
    matches
        .get_many::<String>(id)
        .map(|values| {
            values
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn seconds(matches: &ArgMatches, id: &str) -> Option<Duration> {
    matches.get_one::<u64>(id).copied().map(Duration::from_secs)
}

/// # Errors
/// Returns an error if required arguments are missing or malformed.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    let environment: Environment = string(matches, "environment")?.parse()?;
    let log_detail = matches
        .get_one::<String>("log-detail")
        .map(|detail| detail.parse())
        .transpose()
        .map_err(|err: String| anyhow::anyhow!(err))?;

    Ok(Action::Server(Box::new(Args {
        port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
        environment,
        upstream_url: url(matches, "upstream-url")?,
        identity_url: url(matches, "identity-url")?,
        identity_api_key: secret(matches, "identity-api-key")?,
        privilege_url: url(matches, "privilege-url")?,
        privilege_api_key: secret(matches, "privilege-api-key")?,
        csrf_secret: secret(matches, "csrf-secret")?,
        dsn: matches
            .get_one::<String>("dsn")
            .cloned()
            .map(SecretString::from),
        protected_routes: list(matches, "protected-routes"),
        admin_routes: list(matches, "admin-routes"),
        public_routes: list(matches, "public-routes"),
        login_endpoints: list(matches, "login-endpoints"),
        redirects: RedirectTargets {
            login: string(matches, "login-path")?,
            unauthorized: string(matches, "unauthorized-path")?,
            maintenance: string(matches, "maintenance-path")?,
            home: string(matches, "home-path")?,
        },
        maintenance: matches.get_flag("maintenance"),
        ip_limit: matches.get_one::<u32>("ip-limit").copied(),
        account_limit: matches.get_one::<u32>("account-limit").copied(),
        limit_window: seconds(matches, "limit-window-seconds"),
        block_duration: seconds(matches, "block-seconds"),
        trust_forwarded_for: matches.get_flag("trust-forwarded-for"),
        csrf_max_age: seconds(matches, "csrf-max-age-seconds"),
        refresh_threshold: seconds(matches, "session-refresh-threshold-seconds"),
        admin_cache_ttl: seconds(matches, "admin-cache-ttl-seconds"),
        privilege_timeout: seconds(matches, "privilege-timeout-seconds"),
        identity_timeout: seconds(matches, "identity-timeout-seconds"),
        secure_cookies: matches.get_one::<bool>("secure-cookies").copied(),
        hsts: matches.get_one::<bool>("hsts").copied(),
        content_security_policy: matches.get_one::<String>("content-security-policy").cloned(),
        log_detail,
        log_include_ip: matches.get_one::<bool>("log-include-ip").copied(),
    })))
}
