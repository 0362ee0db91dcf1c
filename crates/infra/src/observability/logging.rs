//! Tracing subscriber setup

use calsync_domain::LoggingConfig;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted before `RUST_LOG`
pub const LOG_ENV_VAR: &str = "CALSYNC_LOG";

/// Build the filter: `CALSYNC_LOG`, then `RUST_LOG`, then the configured level.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    for var in [LOG_ENV_VAR, EnvFilter::DEFAULT_ENV] {
        // An unparsable directive falls through to the next source
        if let Some(filter) = std::env::var(var).ok().and_then(|d| EnvFilter::try_new(d).ok()) {
            return filter;
        }
    }
    EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, which makes
/// repeated calls (tests, embedding applications) harmless.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = build_filter(config);
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_configured_level() {
        let config = LoggingConfig { level: "calsync_infra=debug".into(), json: false };
        if std::env::var(LOG_ENV_VAR).is_err() && std::env::var(EnvFilter::DEFAULT_ENV).is_err() {
            assert_eq!(build_filter(&config).to_string(), "calsync_infra=debug");
        }
    }

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
