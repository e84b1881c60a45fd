// Local crates
use crate::helpers::load_config::LoggingConfig;

// External crates
use anyhow::{Context, Result};
use std::panic;
use tracing::error;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    filter::{Directive, EnvFilter},
    fmt,
    prelude::*,
    registry::Registry,
};

/// File name prefix for the daily rolling log file.
const LOG_FILE_PREFIX: &str = "telemetry-bridge.log";

/// Install the global subscriber.
///
/// Human readable or JSON lines go to stderr; when `directory` is set, JSON
/// lines are also written to a daily rolling file through a non-blocking
/// writer whose guard must outlive the runtime. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(cfg: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let mut filter = EnvFilter::new(&cfg.level);
            if let Ok(hyper_directive) = "hyper=warn".parse::<Directive>() {
                filter = filter.add_directive(hyper_directive);
            }
            filter
        }
    };

    let fmt_layer = (!cfg.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_thread_ids(true)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    });

    let json_layer = cfg.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    });

    let (file_layer, guard) = match &cfg.directory {
        Some(directory) => {
            let file_appender = rolling::daily(directory, LOG_FILE_PREFIX);
            let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(non_blocking_writer)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(false)
                .with_timer(fmt::time::UtcTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let error_layer = ErrorLayer::default();

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(json_layer)
        .with(file_layer)
        .with(error_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    Ok(guard)
}

/// Route panics through `tracing` as well as stderr.
pub fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => (*s).to_string(),
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => s.clone(),
                None => "Unknown panic".to_string(),
            },
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            message = %msg,
            location = %location,
            "Application panicked!"
        );
        eprintln!("telemetry-bridge panicked at {location}: {msg}");
    }));
}
