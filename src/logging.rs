//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and, when
//! `TASKER_ASYNC_LOG_DIR` is set, to a JSON log file per process.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::DispatchError;
use crate::messaging::RetryMetadata;
use crate::worker::Outcome;

/// Directory for JSON log files; unset disables file output
pub const LOG_DIR_ENV: &str = "TASKER_ASYNC_LOG_DIR";

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
        };

        let (file_layer, guard, log_path) = match file_writer(&environment) {
            Some((writer, guard, path)) => (
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_ansi(false)
                        .json()
                        .with_filter(filter()),
                ),
                Some(guard),
                Some(path),
            ),
            None => (None, None, None),
        };

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(filter()),
            )
            .with(file_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_file = %log_path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string()),
            "Structured logging initialized"
        );

        // The writer thread lives for the whole process
        if let Some(guard) = guard {
            std::mem::forget(guard);
        }
    });
}

fn file_writer(
    environment: &str,
) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard, PathBuf)> {
    let log_dir = PathBuf::from(std::env::var(LOG_DIR_ENV).ok()?);
    if fs::create_dir_all(&log_dir).is_err() {
        return None;
    }

    let file_name = format!(
        "{}.{}.{}.log",
        environment,
        process::id(),
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    let path = log_dir.join(&file_name);
    let appender = tracing_appender::rolling::never(&log_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Some((writer, guard, path))
}

/// Current environment from `TASKER_ENV`, defaulting to development
fn get_environment() -> String {
    std::env::var("TASKER_ENV").unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log a producer-side task operation (`publish`, `buffer`, `commit`, ...)
pub fn log_task_operation(
    operation: &str,
    queue_name: &str,
    target: Option<&str>,
    method: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        queue_name = %queue_name,
        target_type = target,
        method = method,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "TASK_OPERATION"
    );
}

/// Log how a delivery left the worker
pub fn log_delivery_outcome(
    queue_name: &str,
    delivery_tag: u64,
    metadata: &RetryMetadata,
    outcome: Outcome,
    error: Option<&DispatchError>,
) {
    match error {
        None => tracing::info!(
            queue_name = %queue_name,
            delivery_tag,
            retries = metadata.retries,
            retry_mode = %metadata.mode,
            outcome = ?outcome,
            "DELIVERY_OUTCOME"
        ),
        Some(error) => tracing::warn!(
            queue_name = %queue_name,
            delivery_tag,
            retries = metadata.retries,
            retry_mode = %metadata.mode,
            outcome = ?outcome,
            error_code = error.code(),
            error_kind = error.kind(),
            error = %error,
            "DELIVERY_OUTCOME"
        ),
    }
}
