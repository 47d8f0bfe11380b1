use clap::{Arg, ArgAction, Command};

fn seconds(id: &'static str, env: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .long(id)
        .help(help)
        .env(env)
        .value_parser(clap::value_parser!(u64).range(1..))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_limit_args(command);
    let command = with_session_args(command);
    with_header_args(command)
}

fn with_limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("ip-limit")
                .long("ip-limit")
                .help("Failed logins allowed per client IP inside the window (default: per environment)")
                .env("STOREGATE_IP_LIMIT")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("account-limit")
                .long("account-limit")
                .help("Failed logins allowed per IP and account inside the window (default: per environment)")
                .env("STOREGATE_ACCOUNT_LIMIT")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(seconds(
            "limit-window-seconds",
            "STOREGATE_LIMIT_WINDOW_SECONDS",
            "Window in which failed logins are counted (default: 900)",
        ))
        .arg(seconds(
            "block-seconds",
            "STOREGATE_BLOCK_SECONDS",
            "How long a tripped limit blocks the caller (default: 1800)",
        ))
        .arg(
            Arg::new("trust-forwarded-for")
                .long("trust-forwarded-for")
                .help("Take the client address from X-Forwarded-For (only behind a trusted proxy)")
                .env("STOREGATE_TRUST_FORWARDED_FOR")
                .action(ArgAction::SetTrue),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(seconds(
            "csrf-max-age-seconds",
            "STOREGATE_CSRF_MAX_AGE_SECONDS",
            "CSRF token lifetime (default: 3600)",
        ))
        .arg(seconds(
            "session-refresh-threshold-seconds",
            "STOREGATE_SESSION_REFRESH_THRESHOLD_SECONDS",
            "Refresh sessions expiring within this many seconds (default: 900)",
        ))
        .arg(seconds(
            "admin-cache-ttl-seconds",
            "STOREGATE_ADMIN_CACHE_TTL_SECONDS",
            "How long a resolved admin tier is reused (default: 300)",
        ))
        .arg(seconds(
            "privilege-timeout-seconds",
            "STOREGATE_PRIVILEGE_TIMEOUT_SECONDS",
            "Timeout for each privilege directory call (default: 5)",
        ))
        .arg(seconds(
            "identity-timeout-seconds",
            "STOREGATE_IDENTITY_TIMEOUT_SECONDS",
            "Timeout for identity provider calls (default: 10)",
        ))
        .arg(
            Arg::new("secure-cookies")
                .long("secure-cookies")
                .help("Mark session cookies Secure (default: off in development only)")
                .env("STOREGATE_SECURE_COOKIES")
                .value_parser(clap::value_parser!(bool)),
        )
}

fn with_header_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("hsts")
                .long("hsts")
                .help("Send Strict-Transport-Security over TLS (default: on in production only)")
                .env("STOREGATE_HSTS")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new("content-security-policy")
                .long("content-security-policy")
                .help("Content-Security-Policy header value")
                .env("STOREGATE_CONTENT_SECURITY_POLICY"),
        )
}
