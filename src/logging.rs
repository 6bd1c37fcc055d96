//! Logging - tracing subscriber setup

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::core::config::AppConfig;
use crate::core::{Error, Result};

fn filter(config: &AppConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},aleph_ledger={}", config.log_level, config.log_level)))
}

/// Install the global subscriber: stdout always, plus a daily-rolling file
/// under `<data_dir>/logs` when a data dir is configured. Keep the returned
/// guard alive for the life of the process or buffered file output is lost.
pub fn init(config: &AppConfig) -> Result<Option<WorkerGuard>> {
    let stdout = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .with_filter(filter(config));

    let Some(dir) = &config.data_dir else {
        tracing_subscriber::registry()
            .with(stdout)
            .try_init()
            .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;
        return Ok(None);
    };

    let logs = dir.join("logs");
    std::fs::create_dir_all(&logs)?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&logs, "aleph-ledger.log"));
    let file = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
        .with_filter(filter(config));

    tracing_subscriber::registry()
        .with(stdout)
        .with(file)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;
    Ok(Some(guard))
}
