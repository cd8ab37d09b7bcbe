use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

use crate::config::LoggingConfig;
use crate::error::ConfigurationError;

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from
/// `config.default_directive`. With `config.file` set, events are appended to
/// that file (no rotation); otherwise they go to stderr.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigurationError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_directive))
        .map_err(|e| ConfigurationError::Logging(e.to_string()))?;

    if let Some(path) = &config.file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| ConfigurationError::Logging(format!("{} is not a file", path.display())))?;
        std::fs::create_dir_all(dir).map_err(|e| ConfigurationError::Logging(e.to_string()))?;

        let file_appender = rolling::never(dir, file_name);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::new()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter);

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| ConfigurationError::Logging(e.to_string()))?;

        tracing::debug!(
            target: "fathom_core::logging",
            path = %path.display(),
            "Tracing initialized with file output"
        );
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::default()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.ansi)
                    .with_target(true),
            )
            .with(filter);

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| ConfigurationError::Logging(e.to_string()))?;

        tracing::debug!(target: "fathom_core::logging", "Tracing initialized with stderr output");
    }

    Ok(())
}
