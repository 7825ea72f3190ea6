use std::env;

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_ENV: &str = "SPEECHCTL_LOG";
pub const LOG_FORMAT_ENV: &str = "SPEECHCTL_LOG_FORMAT";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unsupported log format `{provided}`; expected `human` or `json`")]
    UnsupportedFormat { provided: String },
    #[error("invalid SPEECHCTL_LOG filter: {source}")]
    InvalidFilter {
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to install tracing subscriber: {source}")]
    InstallFailed {
        #[source]
        source: tracing_subscriber::util::TryInitError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Human,
    Json,
}

/// Diagnostics go to stderr so `--json` output on stdout stays parseable.
pub fn init_logging(verbose: bool) -> Result<(), LoggingError> {
    let format = match env::var(LOG_FORMAT_ENV) {
        Ok(raw) => parse_log_format(&raw)?,
        Err(_) => LogFormat::Human,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter = match env::var(LOG_ENV) {
        Ok(raw) if !raw.trim().is_empty() => EnvFilter::try_new(raw.trim())
            .map_err(|source| LoggingError::InvalidFilter { source })?,
        _ => EnvFilter::new(default_level),
    };

    let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let layer = match format {
        LogFormat::Human => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|source| LoggingError::InstallFailed { source })
}

fn parse_log_format(raw: &str) -> Result<LogFormat, LoggingError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "human" => Ok(LogFormat::Human),
        "json" => Ok(LogFormat::Json),
        other => Err(LoggingError::UnsupportedFormat {
            provided: other.to_owned(),
        }),
    }
}
