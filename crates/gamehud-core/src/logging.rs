//! Tracing setup for the gamehud binary.
//!
//! Logs go to a daily-rolling file under `$GAMEHUD_HOME/logs` so stdout stays
//! free for snapshots. `GAMEHUD_LOG` takes `EnvFilter` directives.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::paths;

pub const LOG_ENV: &str = "GAMEHUD_LOG";
const DEFAULT_DIRECTIVES: &str = "info";
const LOG_FILE_PREFIX: &str = "gamehud.log";

fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Installs the global subscriber writing to [`paths::logs_dir`].
///
/// Keep the returned guard alive until exit; dropping it flushes the file.
pub fn init(verbose: bool) -> Result<WorkerGuard> {
    init_in(&paths::logs_dir(), verbose)
}

pub fn init_in(dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let directives = std::env::var(LOG_ENV).ok();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_names(true);
    let stderr_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(log_filter(directives.as_deref()))
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {e}"))?;

    Ok(guard)
}
