//! Logging setup for the mimir shell
//!
//! Always logs to stderr; also to a daily-rotated file when a log directory is configured.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "warn,mimir=info";

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,mimir=debug")
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    })
}

/// Returns a guard that must be held until exit so buffered file logs are flushed
pub fn init_logging(log_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter(verbose))
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
        return None;
    };

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("cannot create log directory {}: {}", dir.display(), e);
    }
    let file_appender = tracing_appender::rolling::daily(dir, "mimir.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();

    tracing::info!("logging to {}", dir.display());
    Some(guard)
}
