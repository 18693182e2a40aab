//! Structured logging setup.
//!
//! `init` installs one subscriber for the process: an `EnvFilter`, a stderr
//! layer (human or JSON), and a daily-rolling file under `.foreman/logs/`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Stderr log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub format: LogFormat,
    /// Directory for the rolling log file. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
}

/// Keeps the non-blocking file writer flushing. Hold it until exit.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn default_level(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// `FOREMAN_LOG`, then `RUST_LOG`, then the verbosity default.
fn build_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env("FOREMAN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose)))
}

pub fn init(options: &LogOptions) -> Result<LogGuard> {
    let (json_stderr, pretty_stderr) = match options.format {
        LogFormat::Json => (
            Some(fmt::layer().json().with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Pretty => (
            None,
            Some(fmt::layer().with_target(false).with_writer(std::io::stderr)),
        ),
    };

    let (file_layer, file_guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "foreman.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(options.verbose))
        .with(json_stderr)
        .with(pretty_stderr)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(LogGuard { _file: file_guard })
}

/// Span wrapping one control-loop iteration.
#[must_use]
pub fn iteration_span(n: u64) -> Span {
    tracing::info_span!("iteration", n)
}

/// Span for work on a single item.
#[must_use]
pub fn item_span(item_id: &str, phase: &str) -> Span {
    tracing::info_span!("item", item_id = item_id, phase = phase)
}
