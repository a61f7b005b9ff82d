//! # Structured Logging
//!
//! A driver logs human-readable lines to the console and JSON lines to
//! `<log_dir>/<component>.<environment>.<pid>.<started>.log`. The file is
//! what operators grep after the fact; the console is for whoever started it.

use chrono::Utc;
use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Install the global subscriber once per process.
///
/// `RUST_LOG` wins over the per-environment default level. When `log_dir`
/// cannot be created only the console layer is installed.
pub fn init_structured_logging(component: &str, environment: &str, log_dir: &Path) {
    FILE_GUARD.get_or_init(|| {
        let directives =
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level(environment).to_string());
        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(EnvFilter::new(&directives));

        if let Err(e) = std::fs::create_dir_all(log_dir) {
            let _ = tracing_subscriber::registry().with(console).try_init();
            tracing::warn!(dir = %log_dir.display(), error = %e, "Cannot create log directory, console logging only");
            return None;
        }

        let file_name = format!(
            "{component}.{environment}.{}.{}.log",
            std::process::id(),
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, &file_name));
        let json = fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(EnvFilter::new(&directives));

        if tracing_subscriber::registry().with(console).with(json).try_init().is_err() {
            tracing::debug!("A tracing subscriber is already installed, keeping it");
        }
        tracing::info!(
            component,
            environment,
            log_file = %log_dir.join(&file_name).display(),
            "Logging initialized"
        );
        Some(guard)
    });
}

fn default_level(environment: &str) -> &'static str {
    if environment == "production" {
        "info"
    } else {
        "debug"
    }
}

/// One step taken on a task by a controller
pub fn log_task_operation(
    operation: &str,
    task_id: Option<i64>,
    tool: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(operation, task_id, tool, status, details, "task operation");
}

/// Driver start and stop
pub fn log_driver_operation(
    operation: &str,
    driver: &str,
    endpoint_id: Option<i64>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(operation, driver, endpoint_id, status, details, "driver operation");
}

pub fn log_activity_operation(
    operation: &str,
    activity_id: Option<i64>,
    kind: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(operation, activity_id, kind, status, details, "activity operation");
}

/// Errors a driver swallows so the next round can retry
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(component, operation, error, context, "operation failed");
}
