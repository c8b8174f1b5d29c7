// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Logging for the sharedhash tools.
//!
//! Libraries in this workspace log through the `log` facade. The tools install
//! a `tracing` subscriber which receives those records through a bridge, so
//! both kinds of instrumentation end up in the same place.

pub use log::*;

use config::DebugConfig;
use std::io::{Error, ErrorKind};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the background writer alive. Buffered log lines are flushed when this
/// is dropped, so it should be held until the process exits.
#[must_use]
pub struct LogDrain {
    _guard: WorkerGuard,
}

/// Parse the configured log filter.
pub fn filter<T: DebugConfig>(config: &T) -> Result<EnvFilter, Error> {
    EnvFilter::try_new(config.debug().log_level())
        .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("bad log level: {e}")))
}

/// Install the global logger. Fails if a logger was already installed.
pub fn configure_logging<T: DebugConfig>(config: &T) -> Result<LogDrain, Error> {
    let filter = filter(config)?;

    let (writer, guard) = match config.debug().log_file() {
        Some(file) => {
            let path = Path::new(file);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "log file has no name"))?;
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(writer)
            .with_ansi(config.debug().log_file().is_none()),
    );

    tracing::subscriber::set_global_default(subscriber).map_err(Error::other)?;
    tracing_log::LogTracer::init().map_err(Error::other)?;

    Ok(LogDrain { _guard: guard })
}
