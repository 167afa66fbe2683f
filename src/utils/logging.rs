//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured level; `--verbose` bumps the crate to debug.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::toml_config::{LogFormat, LoggingConfig};

/// Build the filter used by [`init_tracing`].
pub fn env_filter(config: &LoggingConfig, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("agora=debug,info")
        } else {
            EnvFilter::new(format!("agora={},warn", config.level))
        }
    })
}

/// Install the global subscriber. Returns an error if one is already set.
pub fn init_tracing(
    config: &LoggingConfig,
    verbose: bool,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = env_filter(config, verbose);

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    }
}
