/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Logging setup
//!
//! The crate itself only emits `tracing` events. Host applications that do
//! not bring their own subscriber can call [`init_log`] to get a console
//! layer, an optional file layer and the one-line formatter below.

use crate::config::LogConfig;
use chrono::Local;
use std::fmt;
use std::path::Path;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{format, FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// `<timestamp> <LEVEL> <target>:<line>:<spans>:<fields>`
pub struct TransportLogFormatter;

impl<S, N> FormatEvent<S, N> for TransportLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            &mut writer,
            "{} {} {}",
            Local::now().format("%FT%T%.6f"),
            metadata.level(),
            metadata.target()
        )?;

        if let Some(line) = metadata.line() {
            write!(&mut writer, ":{line}")?;
        }

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        }

        write!(writer, ":")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Install a global subscriber built from `log`
///
/// Returns the file writer guard; keep it alive for as long as logs should
/// be flushed. If another global subscriber is already installed this one is
/// silently discarded.
pub fn init_log(log: LogConfig) -> WorkerGuard {
    let (file_writer, guard) = match log.file.as_deref().and_then(split_log_path) {
        Some((dir, name)) => {
            let file_appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (Some(non_blocking), guard)
        }
        None => {
            let (_, guard) = tracing_appender::non_blocking(std::io::sink());
            (None, guard)
        }
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .event_format(TransportLogFormatter)
        .with_writer(std::io::stdout);

    let file_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .event_format(TransportLogFormatter)
            .with_writer(writer)
    });

    let filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}

fn split_log_path(file: &str) -> Option<(&Path, &std::ffi::OsStr)> {
    let path = Path::new(file);
    let name = path.file_name()?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    Some((dir.unwrap_or(Path::new(".")), name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_without_directory_uses_cwd() {
        let (dir, name) = split_log_path("transport.log").unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "transport.log");
    }

    #[test]
    fn init_twice_does_not_panic() {
        let _first = init_log(LogConfig::default());
        let _second = init_log(LogConfig {
            level: "debug".to_string(),
            file: None,
        });
        tracing::info!(target: "forgedns_transport", "logging initialised");
    }
}
