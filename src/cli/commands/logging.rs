use clap::{builder::ValueParser, Arg, Command};

pub const ARG_VERBOSITY: &str = "verbosity";

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("STOREGATE_LOG_LEVEL")
                .global(true)
                .action(clap::ArgAction::Count)
                .value_parser(validator_log_level()),
        )
        .arg(
            Arg::new("log-detail")
                .long("log-detail")
                .help("Security log detail: minimal, standard or detailed (default: per environment)")
                .env("STOREGATE_LOG_DETAIL")
                .value_parser(["minimal", "standard", "detailed"]),
        )
        .arg(
            Arg::new("log-include-ip")
                .long("log-include-ip")
                .help("Log client addresses unmasked (default: per environment)")
                .env("STOREGATE_LOG_INCLUDE_IP")
                .value_parser(clap::value_parser!(bool)),
        )
}
