//! Process-wide log sink: JSON lines to stdout and, appended, to the log file.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LogConfig;
use crate::error::Error;
use crate::middleware::access_log::LogLevel;

/// Installs the global subscriber. Call once, early in `main`.
///
/// Fails if the log file cannot be opened or a global subscriber is
/// already installed.
pub fn init(config: &LogConfig) -> Result<(), Error> {
    let file = open_log_file(&config.file)?;

    json_subscriber(config.level, std::io::stdout, Mutex::new(file))
        .try_init()
        .map_err(|e| Error::Subscriber(Box::new(e)))
}

/// A JSON subscriber that writes every record, unchanged, to both sinks.
fn json_subscriber<C, F>(level: LogLevel, console: C, file: F) -> impl Subscriber + Send + Sync + 'static
where
    C: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    F: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_target(false)
        .with_max_level(level.as_filter())
        .with_writer(console.and(file))
        .finish()
}

fn open_log_file(path: &Path) -> Result<File, Error> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
