// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::env;
use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_ENV: &str = "HPCBRIDGE_LOG";
const LOG_FORMAT_ENV: &str = "HPCBRIDGE_LOG_FORMAT";
const LOG_SPAN_EVENTS_ENV: &str = "HPCBRIDGE_LOG_SPAN_EVENTS";
const LOG_FILE_ENV: &str = "HPCBRIDGE_LOG_FILE";

// noisy transport crates stay at warn unless HPCBRIDGE_LOG says otherwise
const QUIET_DEPS: &str = "russh=warn,russh_sftp=warn,sqlx=warn,hyper=warn,reqwest=warn";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// Installs the global subscriber. `log` records from dependencies are bridged
/// through `tracing-subscriber`'s log compatibility layer.
pub fn init(verbose: bool) {
    let filter = build_filter(verbose);
    let span_events = parse_span_events(env::var(LOG_SPAN_EVENTS_ENV).ok().as_deref());
    let format = parse_format(env::var(LOG_FORMAT_ENV).ok().as_deref());
    let registry = Registry::default()
        .with(filter)
        .with(tracing_error::ErrorLayer::default());

    let file = build_file_writer();
    let (file_writer, guard) = match file {
        Some((writer, guard)) => (Some(writer), Some(guard)),
        None => (None, None),
    };

    match format {
        LogFormat::Json => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(span_events.clone());
            let file_layer = file_writer.map(|writer| {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_timer(UtcTime::rfc_3339())
                    .with_span_events(span_events)
                    .with_writer(writer)
            });
            registry.with(stdout_layer).with(file_layer).init();
        }
        LogFormat::Pretty => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(span_events.clone());
            let file_layer = file_writer.map(|writer| {
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(false)
                    .with_timer(UtcTime::rfc_3339())
                    .with_span_events(span_events)
                    .with_writer(writer)
            });
            registry.with(stdout_layer).with(file_layer).init();
        }
        LogFormat::Compact => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(span_events.clone());
            let file_layer = file_writer.map(|writer| {
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_timer(UtcTime::rfc_3339())
                    .with_span_events(span_events)
                    .with_writer(writer)
            });
            registry.with(stdout_layer).with(file_layer).init();
        }
    }

    if let Some(guard) = guard {
        let _ = FILE_GUARD.set(guard);
    }
}

fn build_filter(verbose: bool) -> EnvFilter {
    match env::var(LOG_ENV) {
        Ok(value) => EnvFilter::new(value),
        Err(_) => EnvFilter::new(default_directives(verbose)),
    }
}

fn default_directives(verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        format!("info,{QUIET_DEPS}")
    }
}

fn normalized(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_ascii_lowercase())
}

fn parse_format(raw: Option<&str>) -> LogFormat {
    match normalized(raw).as_deref() {
        Some("json") => LogFormat::Json,
        Some("pretty") => LogFormat::Pretty,
        _ => LogFormat::Compact,
    }
}

fn parse_span_events(raw: Option<&str>) -> FmtSpan {
    match normalized(raw).as_deref() {
        Some("new") => FmtSpan::NEW,
        Some("enter") => FmtSpan::ENTER,
        Some("exit") => FmtSpan::EXIT,
        Some("close") => FmtSpan::CLOSE,
        Some("full") => FmtSpan::FULL,
        _ => FmtSpan::NONE,
    }
}

fn build_file_writer() -> Option<(NonBlocking, WorkerGuard)> {
    let file_path = env::var(LOG_FILE_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    let path = Path::new(&file_path);
    let file_name = path.file_name()?.to_string_lossy().to_string();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let appender = tracing_appender::rolling::never(dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}
