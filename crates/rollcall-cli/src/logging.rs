//! Tracing setup.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logs to stdout only.
pub fn init_stdout(log_level: &str) {
    tracing_subscriber::registry()
        .with(filter(log_level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Name of the log file for a run started at `started_at`.
pub fn log_file_name(started_at: DateTime<Local>) -> String {
    format!("rollcall_log_{}.log", started_at.format("%Y%m%d_%H%M%S"))
}

/// Creates the per-run log file in `log_dir`, returning it with its
/// absolute path.
pub fn create_run_log(log_dir: &Path, started_at: DateTime<Local>) -> Result<(File, PathBuf)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let path = log_dir.join(log_file_name(started_at));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let path = std::fs::canonicalize(&path).unwrap_or(path);
    Ok((file, path))
}

/// Logs to stdout and to a fresh per-run file in `log_dir`.
///
/// Returns the absolute path of the log file.
pub fn init_run(log_level: &str, log_dir: &Path) -> Result<PathBuf> {
    let (file, path) = create_run_log(log_dir, Local::now())?;

    tracing_subscriber::registry()
        .with(filter(log_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(path)
}
