//! Structured logging init for the proxy binary.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber. `level` seeds an `EnvFilter`
/// (overridable by `RUST_LOG`); `structured` selects JSON output, otherwise
/// compact human-readable output.
///
/// Safe to call more than once; subsequent calls are no-ops (matters for
/// tests and for the CLI's two-phase init: a bootstrap subscriber before
/// the config file is read, then a real one once the configured level and
/// format are known).
pub fn init(level: &str, structured: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = if structured {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .try_init()
    };

    if let Err(err) = result {
        tracing::debug!("tracing subscriber already initialized: {err}");
    }
}
