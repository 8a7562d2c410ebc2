use super::config::{LogFormat, LogLevel};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Targets that are only interesting when something is wrong.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("Tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// `RUST_LOG` when set, otherwise the configured level with noisy
/// dependencies turned down to `warn`.
pub fn build_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(from_env) = std::env::var(EnvFilter::DEFAULT_ENV)
        && !from_env.trim().is_empty()
    {
        return EnvFilter::try_new(&from_env).map_err(|e| LoggingError::InvalidFilter {
            filter: from_env,
            reason: e.to_string(),
        });
    }

    let mut filter = tracing::Level::from(level).as_str().to_ascii_lowercase();
    for target in QUIET_TARGETS {
        filter.push_str(&format!(",{target}=warn"));
    }
    EnvFilter::try_new(&filter).map_err(|e| LoggingError::InvalidFilter {
        filter,
        reason: e.to_string(),
    })
}

pub fn init_tracing(level: LogLevel, format: LogFormat) -> Result<(), LoggingError> {
    let filter = build_filter(level)?;
    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true),
            )
            .with(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
    };
    installed.map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
}
