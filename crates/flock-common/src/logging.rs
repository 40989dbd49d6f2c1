//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Shared primitives and utilities for the driver runtime."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "FLOCK_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

// Writer guards must outlive the subscriber or buffered lines are lost.
static GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();

/// Console output formats. The rolling file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
    Compact,
}

/// Filter from `FLOCK_LOG`, then `RUST_LOG`, then `info`.
fn env_filter(flock_log: Option<&str>) -> EnvFilter {
    if let Some(directive) = flock_log {
        return EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!("ignoring invalid {LOG_ENV} directive ({err}); using {DEFAULT_DIRECTIVE}");
            EnvFilter::new(DEFAULT_DIRECTIVE)
        });
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

fn console_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).pretty().boxed(),
        LogFormat::Compact => layer.with_target(false).compact().boxed(),
    }
}

/// Install the global subscriber: console output in the configured format
/// plus a daily rolling `<prefix>.log` JSON file.
///
/// Returns `false` when a subscriber was already installed; the call is then
/// a no-op apart from creating the log directory.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<bool> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
    let (console_writer, console_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_current_span(true)
        .with_writer(file_writer);

    let installed = tracing_subscriber::registry()
        .with(env_filter(std::env::var(LOG_ENV).ok().as_deref()))
        .with(console_layer(config.format, console_writer))
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return Ok(false);
    }

    let _ = GUARDS.set((file_guard, console_guard));
    info!(
        service = service_name,
        log_dir = %config.directory.display(),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(true)
}
