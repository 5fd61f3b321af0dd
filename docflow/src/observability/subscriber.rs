//! Global subscriber installation.

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::DocflowError;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.filter` when set. Returns
/// `Ok(false)` if a global subscriber was already installed, which makes
/// repeated calls from tests harmless.
///
/// # Errors
///
/// [`DocflowError::Config`] if the filter directive does not parse.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, DocflowError> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.filter),
    }
    .map_err(|err| DocflowError::Config(format!("invalid log filter '{}': {err}", config.filter)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let installed = match config.format {
        LogFormat::Pretty => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().with_current_span(true).try_init().is_ok(),
    };
    Ok(installed)
}
