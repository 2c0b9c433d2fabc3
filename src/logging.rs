use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable that overrides the computed filter (`RUST_LOG` syntax).
pub const LOG_FILTER_ENV: &str = "SCANWARDEN_LOG";

/// Log file prefix inside the log directory.
pub const LOG_PREFIX: &str = "scanwarden";

/// Filter used when `SCANWARDEN_LOG` is unset.
///
/// Debug mode only raises this crate to `debug`; dependencies such as
/// `reqwest` and `notify` stay at `info`.
pub fn default_filter(debug_mode: bool) -> String {
    let own = if debug_mode { "debug" } else { "info" };
    format!("info,{}={}", env!("CARGO_CRATE_NAME"), own)
}

fn build_filter(debug_mode: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter(debug_mode)))
}

fn ensure_log_dir(log_dir: &Utf8Path) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir))?;
    }
    Ok(())
}

/// Setup logging with a daily rotating file appender and optional console output.
///
/// Console output goes to stderr so it never mixes with scan results printed
/// on stdout.
///
/// # Arguments
/// * `log_dir` - Directory for log files
/// * `debug_mode` - If true, this crate logs at debug level
/// * `console_output` - If true, also log to stderr
///
/// # Returns
/// A guard that must be held for the duration of the program to keep logging active
pub fn setup_logging(log_dir: &Utf8Path, debug_mode: bool, console_output: bool) -> Result<WorkerGuard> {
    ensure_log_dir(log_dir)?;

    let file_appender = rolling::daily(log_dir.as_std_path(), LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false) // No ANSI codes in log files
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = console_output.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(build_filter(debug_mode))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!(
        "Logging initialized: dir={}, debug={}, console={}",
        log_dir,
        debug_mode,
        console_output
    );

    Ok(guard)
}

/// Emit one log line per event as JSON, for machine consumption.
pub fn setup_json_logging(log_dir: &Utf8Path, debug_mode: bool) -> Result<WorkerGuard> {
    ensure_log_dir(log_dir)?;

    let file_appender = rolling::daily(log_dir.as_std_path(), format!("{}.json", LOG_PREFIX));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(build_filter(debug_mode))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_current_span(false),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(guard)
}
