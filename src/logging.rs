use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// File name prefix of the daily log files (`nioh3mm.2026-10-16`).
pub const LOG_FILE_PREFIX: &str = "nioh3mm";

/// Where and how the CLI logs.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: Utf8PathBuf,
    pub file_prefix: String,
    /// Debug level instead of info; `RUST_LOG` overrides both.
    pub debug: bool,
    /// Mirror log lines to stderr. Stdout is left to command output.
    pub console: bool,
    /// One JSON object per line in the log file.
    pub json: bool,
}

impl LogConfig {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file_prefix: LOG_FILE_PREFIX.to_string(),
            debug: false,
            console: false,
            json: false,
        }
    }

    /// `logs/` next to `settings.yaml`.
    pub fn in_config_dir(config_dir: &Utf8Path) -> Self {
        Self::new(config_dir.join("logs"))
    }
}

fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }))
}

/// Install the global subscriber: a daily rolling file plus, optionally, stderr.
///
/// The returned guard flushes the file writer on drop and must live until
/// the program exits. Fails if a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<WorkerGuard> {
    fs::create_dir_all(&config.dir)
        .with_context(|| format!("Failed to create log directory: {}", config.dir))?;

    let (writer, guard) =
        tracing_appender::non_blocking(rolling::daily(&config.dir, &config.file_prefix));

    let text_file = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer.clone())
            .with_ansi(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });
    let json_file = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(false)
    });
    let console = config.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(env_filter(config.debug))
        .with(text_file)
        .with(json_file)
        .with(console)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!(
        "Logging to {}/{}.* (debug={}, console={}, json={})",
        config.dir,
        config.file_prefix,
        config.debug,
        config.console,
        config.json
    );
    Ok(guard)
}
