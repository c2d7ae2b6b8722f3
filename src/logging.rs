use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ConfigError, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level; `debug` forces `debug`. The returned guard
/// flushes the log file and must live as long as the program.
pub fn init(config: &LoggingConfig, debug: bool) -> Result<Option<WorkerGuard>> {
    let level = if debug { "debug" } else { config.level.as_str() };
    let directive = format!("plugin_host={}", level)
        .parse()
        .map_err(|e| ConfigError::Validation(format!("invalid log level '{}': {}", level, e)))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let (file, guard) = match &config.file {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
            let prefix = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "plugin-host.log".to_string());
            let appender = tracing_appender::rolling::daily(
                directory.unwrap_or_else(|| std::path::Path::new(".")),
                prefix,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match (file, config.json) {
        (Some(file), true) => builder
            .json()
            .with_writer(std::io::stderr.and(file))
            .try_init(),
        (Some(file), false) => builder.with_writer(std::io::stderr.and(file)).try_init(),
        (None, true) => builder.json().with_writer(std::io::stderr).try_init(),
        (None, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| ConfigError::Validation(format!("failed to install logger: {}", e)))?;

    Ok(guard)
}
