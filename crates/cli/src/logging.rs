use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. Logs always go to stderr so that generated text on stdout
/// stays clean; `quiet` pins the filter to errors regardless of `RUST_LOG`.
pub fn init(quiet: bool) {
    INIT.call_once(|| {
        let filter = if quiet {
            EnvFilter::new("error")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(!quiet)
            .with_writer(std::io::stderr)
            .init();
    });
}
