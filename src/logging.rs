//! Console logging initialization.
//!
//! Status lines go to stdout in a compact format. The filter is taken from
//! `HEARTBAND_LOG` (standard `EnvFilter` syntax) and otherwise defaults to `info`,
//! or `debug` in verbose mode.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable overriding the log filter.
pub const LOG_ENV: &str = "HEARTBAND_LOG";

fn default_level(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Build the log filter from the environment or the verbosity flag.
///
/// # Errors
/// Returns an error if the fallback directive cannot be parsed.
pub fn env_filter(verbose: bool) -> Result<EnvFilter, ParseError> {
    EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_new(default_level(verbose)))
}

/// Install the global subscriber.
///
/// # Errors
/// Returns an error if the log filter cannot be parsed.
pub fn init(verbose: bool) -> Result<(), ParseError> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(env_filter(verbose)?)
        .with(stdout_layer)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_follows_verbosity() {
        assert_eq!(default_level(false), "info");
        assert_eq!(default_level(true), "debug");
    }

    #[test]
    fn test_env_filter_builds() {
        assert!(env_filter(false).is_ok());
        assert!(env_filter(true).is_ok());
    }
}
