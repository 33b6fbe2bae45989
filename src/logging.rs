// ABOUTME: Tracing subscriber setup: stderr output plus a daily-rolling log file.
// ABOUTME: SPOOL_LOG_JSON=1 switches the stderr layer to JSON; RUST_LOG overrides the default filter.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

/// Whether SPOOL_LOG_JSON asks for JSON console output
pub fn json_requested() -> bool {
    std::env::var("SPOOL_LOG_JSON")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Install the global subscriber. The returned guard flushes the file writer on drop,
/// so hold it for the life of the process.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("spool")
        .filename_suffix("log")
        .build(log_dir)
        .context("Failed to initialize rolling log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let json = json_requested();

    let console_text = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    let console_json = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_text)
        .with(console_json)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
