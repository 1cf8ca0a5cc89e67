//! Log output for the command-line tool.
//!
//! Library crates log through the `log` facade; the subscriber installed
//! here picks those records up through the `tracing-log` bridge.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "UPYLINK_LOG";

/// Filter for this run: `--verbose` forces `debug`, otherwise
/// `UPYLINK_LOG` applies, otherwise `info`.
pub fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the stderr subscriber. Calling it twice is harmless.
pub fn init(verbose: bool) {
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    if let Err(e) = result {
        tracing::debug!("Logging already initialised: {}", e);
    }
}
