pub mod logging;
mod routes;
mod security;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("storegate")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("STOREGATE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("environment")
                .short('e')
                .long("environment")
                .help("Deployment environment, picks the defaults for limits, logging and HSTS")
                .env("STOREGATE_ENVIRONMENT")
                .default_value("development")
                .value_parser(["development", "dev", "staging", "production", "prod"]),
        )
        .arg(
            Arg::new("upstream-url")
                .short('u')
                .long("upstream-url")
                .help("Storefront that receives the requests let through, example: http://127.0.0.1:3000")
                .env("STOREGATE_UPSTREAM_URL")
                .required(true),
        )
        .arg(
            Arg::new("identity-url")
                .long("identity-url")
                .help("Identity provider base URL, example: https://project.tld/auth/v1")
                .env("STOREGATE_IDENTITY_URL")
                .required(true),
        )
        .arg(
            Arg::new("identity-api-key")
                .long("identity-api-key")
                .help("API key sent to the identity provider")
                .env("STOREGATE_IDENTITY_API_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("privilege-url")
                .long("privilege-url")
                .help("Privilege directory base URL, example: https://project.tld/rest/v1")
                .env("STOREGATE_PRIVILEGE_URL")
                .required(true),
        )
        .arg(
            Arg::new("privilege-api-key")
                .long("privilege-api-key")
                .help("API key sent to the privilege directory")
                .env("STOREGATE_PRIVILEGE_API_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("csrf-secret")
                .long("csrf-secret")
                .help("HMAC secret for CSRF tokens, at least 32 bytes")
                .env("STOREGATE_CSRF_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("PostgreSQL connection string for state shared between instances")
                .long_help(
                    "PostgreSQL connection string. Without it rate limits, the admin cache and the violation log stay in process memory.",
                )
                .env("STOREGATE_DSN")
                .hide_env_values(true),
        );

    let command = routes::with_args(command);
    let command = security::with_args(command);
    logging::with_args(command)
}
