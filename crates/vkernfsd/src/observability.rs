//! Logging wiring: level and format from the CLI, text or JSON, stderr or a
//! log file.

use std::fs::OpenOptions;

use anyhow::{bail, Context, Result};
use tracing::Level;
use tracing_subscriber::prelude::*;

use crate::Opts;

enum LogFormat {
    Text,
    Json,
}

fn detect_log_format(input: &str) -> Result<LogFormat> {
    match input {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        unknown => bail!("unknown log format: {unknown}"),
    }
}

/// The CLI keeps the syslog-flavored names; `warning` and `fatal` fold onto
/// the nearest tracing levels.
fn detect_log_level(input: &str) -> Result<Level> {
    match input {
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warning" => Ok(Level::WARN),
        "error" | "fatal" => Ok(Level::ERROR),
        unknown => bail!("unknown log level: {unknown}"),
    }
}

pub fn init(opts: &Opts) -> Result<()> {
    let level = detect_log_level(&opts.log_level)?;
    let level_filter = tracing_subscriber::filter::LevelFilter::from(level);
    let format = detect_log_format(&opts.log_format)?;
    let subscriber = tracing_subscriber::registry().with(level_filter);

    // One branch per (writer, format) combination; the fmt layer types do
    // not unify across them.
    match (&opts.log, format) {
        (None, LogFormat::Text) => {
            subscriber
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {e}"))?;
        }
        (None, LogFormat::Json) => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_span_list(false)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {e}"))?;
        }
        (Some(path), LogFormat::Text) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            subscriber
                .with(tracing_subscriber::fmt::layer().with_writer(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {e}"))?;
        }
        (Some(path), LogFormat::Json) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_span_list(false)
                        .with_writer(file),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {e}"))?;
        }
    }

    Ok(())
}
