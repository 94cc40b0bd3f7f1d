//! Logging setup for the operator
//!
//! Logs go to stdout with millisecond timestamps; a file target is added when
//! file logging is enabled and `logging.file` names a path.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the tracing subscriber based on configuration.
///
/// The `--log-level` CLI flag overrides the configured level; `RUST_LOG`
/// overrides both.
pub fn init_logging(config: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let level = level_override.unwrap_or(&config.level);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer()
        .with_timer(fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .with_target(false);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    let file = config.file.as_ref().filter(|_| config.enabled);
    match file {
        Some(file) => {
            let log_path = PathBuf::from(file);
            let log_dir = log_path
                .parent()
                .context("invalid log file path")?
                .to_path_buf();
            let log_filename = log_path
                .file_name()
                .context("invalid log filename")?
                .to_str()
                .context("invalid UTF-8 in log filename")?;

            std::fs::create_dir_all(&log_dir).with_context(|| {
                format!("failed to create log directory: {}", log_dir.display())
            })?;

            let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::NEVER)
                .filename_prefix(log_filename)
                .build(log_dir)
                .context("failed to create log file appender")?;

            let file_layer = fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                ))
                .with_target(false);

            registry
                .with(file_layer)
                .try_init()
                .context("failed to initialize tracing subscriber")?;
        }
        None => {
            registry
                .try_init()
                .context("failed to initialize tracing subscriber")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggingConfig;

    #[test]
    fn test_init_logging_stdout() {
        // Only the first init in the process can succeed; both outcomes are
        // acceptable as long as nothing panics.
        let _ = init_logging(&LoggingConfig::default(), Some("debug"));
    }
}
