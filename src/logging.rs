use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Keeps the file writer flushing; drop it only at process exit.
pub struct LogGuard {
    _file: WorkerGuard,
    pub path: PathBuf,
}

/// `logs/<prefix>_YYYYmmdd_HHMMSS.log` plus stderr.
///
/// `RUST_LOG` wins over `config.level`.
pub fn init(prefix: &str, config: &LoggingConfig) -> Result<LogGuard> {
    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("failed to create {}", config.directory.display()))?;

    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let filename = format!("{}_{}.log", prefix, ts);
    let path = config.directory.join(&filename);

    let appender = tracing_appender::rolling::never(&config.directory, &filename);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .ok();

    Ok(LogGuard { _file: guard, path })
}
