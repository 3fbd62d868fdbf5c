//! Subscriber setup for the binary.

use anyhow::{Context, Result};
use phasegate::config::PhasegateConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

const LOG_FILE_PREFIX: &str = "phasegate.log";

/// Install stderr logging plus a daily JSON log under `<state dir>/logs/`.
///
/// The file layer is only attached once the state directory exists, so
/// read-only commands never create it. Keep the returned guard alive until
/// exit or buffered file lines are lost.
pub fn init(config: &PhasegateConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    let stderr_layer = if config.toml.logging.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match config.state_paths() {
        Ok(paths) if paths.dir.is_dir() && std::fs::create_dir_all(&paths.logs_dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(&paths.logs_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
