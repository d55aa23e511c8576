use std::{fs::OpenOptions, io, path::Path};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::LogLevel;

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`. Logs are also
/// appended to `file`, if any; the returned guard flushes it and must be held until exit.
pub(crate) fn init(level: LogLevel, file: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let (file_layer, guard) = match file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    // Fails only if a subscriber is already installed, which is fine.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init();

    Ok(guard)
}
