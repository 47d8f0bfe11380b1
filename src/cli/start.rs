use anyhow::Result;
use tracing::Level;

use crate::cli::{actions::Action, commands, dispatch, telemetry};

/// `-v` occurrences (or `STOREGATE_LOG_LEVEL`) to a log level. `None` keeps
/// the error-only default.
const fn level_from_count(count: u8) -> Option<Level> {
    match count {
        0 => None,
        1 => Some(Level::WARN),
        2 => Some(Level::INFO),
        3 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

/// Parse the command line, install telemetry and pick the action.
///
/// # Errors
/// Returns an error if telemetry cannot be installed or the options do not
/// describe a valid gateway.
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();
    let count = matches
        .get_one::<u8>(commands::logging::ARG_VERBOSITY)
        .copied()
        .unwrap_or_default();
    telemetry::init(level_from_count(count))?;
    dispatch::handler(&matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_map_to_levels() {
        let levels: Vec<_> = (0..=5).map(level_from_count).collect();
        assert_eq!(
            levels,
            vec![
                None,
                Some(Level::WARN),
                Some(Level::INFO),
                Some(Level::DEBUG),
                Some(Level::TRACE),
                Some(Level::TRACE),
            ]
        );
    }
}
