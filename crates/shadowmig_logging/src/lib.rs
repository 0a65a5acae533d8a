//! Shared logging setup for shadowmig binaries.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "shadowmig=info,shadowmig_cli=info";
const VERBOSE_LOG_FILTER: &str = "shadowmig=debug,shadowmig_cli=debug,sqlx=warn";
const QUIET_LOG_FILTER: &str = "warn";

/// Logging configuration shared by shadowmig binaries.
#[derive(Debug, Clone, Default)]
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Debug output for shadowmig crates on stderr.
    pub verbose: bool,
    /// Only warnings and errors on stderr.
    pub quiet: bool,
    /// Also write a daily-rolling log file here.
    pub log_dir: Option<PathBuf>,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. The returned guard flushes the
/// file writer on drop and must be held until the program exits.
pub fn init_logging(config: LogConfig<'_>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            ensure_log_dir(dir)?;
            let appender = tracing_appender::rolling::daily(dir, log_file_name(config.app_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(DEFAULT_LOG_FILTER));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter(&config));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn console_filter(config: &LogConfig<'_>) -> EnvFilter {
    if config.quiet {
        EnvFilter::new(QUIET_LOG_FILTER)
    } else if config.verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        env_filter(DEFAULT_LOG_FILTER)
    }
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Create the log directory if needed.
pub fn ensure_log_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))
}

/// File name prefix for `app_name`; the appender adds the date suffix.
fn log_file_name(app_name: &str) -> String {
    let base: String = app_name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    let base = if base.is_empty() { "shadowmig".to_string() } else { base };
    format!("{}.log", base)
}
