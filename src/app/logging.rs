use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::app::config::LoggingConfig;
use crate::error::{Error, Result};

pub const LOG_FILE_PREFIX: &str = "conductor.log";

fn effective_level(config: &LoggingConfig, verbose: bool) -> &str {
    if verbose {
        "debug"
    } else {
        config.level.trim()
    }
}

/// `RUST_LOG` wins when set; otherwise `conductor=<level>`, or `conductor=debug` when verbose.
pub fn build_filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let level = effective_level(config, verbose);
    let directive = format!("conductor={}", level.to_lowercase());
    EnvFilter::try_new(&directive)
        .map_err(|e| Error::validation(format!("Invalid log level '{}': {}", level, e)))
}

/// Installs the global subscriber. Keep the returned guard alive for as long as
/// file output should be flushed.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config, verbose)?;
    let stderr = fmt::layer().with_target(true).with_writer(std::io::stderr);
    let registry = Registry::default().with(filter).with(stderr);

    let guard = match config.directory.as_deref().filter(|d| !d.is_empty()) {
        Some(directory) => {
            std::fs::create_dir_all(Path::new(directory))?;
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
            registry.with(file).try_init().map_err(already_installed)?;
            Some(guard)
        }
        None => {
            registry.try_init().map_err(already_installed)?;
            None
        }
    };

    let level = effective_level(config, verbose);
    info!("Logging initialized at level {}", level);
    Ok(guard)
}

fn already_installed(e: tracing_subscriber::util::TryInitError) -> Error {
    Error::validation(format!("Logging already initialized: {}", e))
}
