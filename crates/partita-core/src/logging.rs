//! Logging and tracing initialization for Partita.
//!
//! The pools, registry, and facade emit `tracing` events; nothing is
//! printed until a subscriber is installed with one of the functions here.
//!
//! ## Configuration
//!
//! The logging level can be controlled via the `RUST_LOG` environment variable:
//!
//! ```bash
//! # Show every acquire and release
//! RUST_LOG=partita_core=debug partita get 1
//!
//! # Only failovers, exhaustion, and worse
//! RUST_LOG=warn partita bench
//! ```

use std::str::FromStr;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(LogFormat::Plain),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {:?}", other)),
        }
    }
}

/// Initialize logging in the given format.
///
/// The log level is controlled by the `RUST_LOG` environment variable and
/// defaults to `info`.
///
/// # Panics
///
/// This function will panic if called multiple times. Only call it once
/// at application startup.
pub fn init_logging_with_format(format: LogFormat) {
    if let Err(err) = try_init_logging(format) {
        panic!("failed to install the tracing subscriber: {}", err);
    }
}

/// Like [`init_logging_with_format`], but reports a second installation
/// as an error instead of panicking.
pub fn try_init_logging(format: LogFormat) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Plain => registry.with(fmt::layer()).try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_line_number(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().flatten_event(true)).try_init(),
    }
}

/// Plain single-line logs.
pub fn init_logging() {
    init_logging_with_format(LogFormat::Plain);
}

/// Pretty multi-line logs with thread ids (recommended for development).
pub fn init_logging_pretty() {
    init_logging_with_format(LogFormat::Pretty);
}

/// One JSON object per event (recommended for production).
pub fn init_logging_json() {
    init_logging_with_format(LogFormat::Json);
}
