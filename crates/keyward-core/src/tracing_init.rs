//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter and optional JSON output.
//! `RUST_LOG` always wins over the filter derived from the configured level.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the default filter directive for a crate, e.g. `keyward_maintenance=info`.
pub fn default_filter(crate_name: &str, log_level: &str) -> String {
    format!("{}={log_level}", crate_name.replace('-', "_"))
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (see [`default_filter`]).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Calling this twice is harmless; the second subscriber is discarded.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_normalises_crate_name() {
        assert_eq!(
            default_filter("keyward-maintenance", "debug"),
            "keyward_maintenance=debug"
        );
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_tracing("keyward_core=info", false);
        init_tracing("keyward_core=info", true);
    }
}
