//! Tracing subscriber setup for the CLI and embedding applications
//!
//! Logs go to stderr by default so stdout stays free for command output.

use crate::error::BoxedSource;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty, compact)
    pub format: LogFormat,
    /// Add source file and line to each event
    pub include_location: bool,
    /// Add thread id and name to each event
    pub include_thread: bool,
    /// Append to `log_file_path` instead of writing to stderr
    pub log_to_file: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<String>,
    /// Emit span close events with timings
    pub enable_performance_monitoring: bool,
    /// Extra `EnvFilter` directives such as `kinderhub_session=debug`
    pub filter_directives: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            include_location: false,
            include_thread: false,
            log_to_file: false,
            log_file_path: None,
            enable_performance_monitoring: false,
            filter_directives: vec![
                "kinderhub_core=info".to_string(),
                "kinderhub_session=info".to_string(),
            ],
        }
    }
}

fn make_writer(config: &LoggingConfig) -> Result<BoxMakeWriter, BoxedSource> {
    if !config.log_to_file {
        return Ok(BoxMakeWriter::new(std::io::stderr));
    }

    let Some(log_path) = &config.log_file_path else {
        return Err("log_file_path must be specified when log_to_file is true".into());
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    Ok(BoxMakeWriter::new(Mutex::new(file)))
}

/// Initialize the global tracing subscriber
///
/// Fails if a subscriber has already been installed for this process.
pub fn init_logging(config: &LoggingConfig) -> Result<(), BoxedSource> {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    for directive in &config.filter_directives {
        filter = filter.add_directive(directive.parse()?);
    }

    let base = fmt::layer()
        .with_writer(make_writer(config)?)
        .with_span_events(if config.enable_performance_monitoring {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread)
        .with_thread_names(config.include_thread);

    let fmt_layer = match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()?;

    Ok(())
}

/// Timing helpers; output appears under the `kinderhub::timing` target
pub mod performance {
    use std::time::Instant;
    use tracing::{info_span, Instrument};

    /// Measure and log execution time of an async operation
    pub async fn measure_async<F, T>(operation_name: &str, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let started = Instant::now();
        let output = future
            .instrument(info_span!("timed", op = operation_name))
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(target: "kinderhub::timing", op = operation_name, elapsed_ms, "finished");
        output
    }
}

// Operation lifecycle macros. Every session action logs one start line and
// exactly one of success or error, keyed by `op`.

#[macro_export]
macro_rules! log_operation_start {
    ($op:expr $(, $($field:tt)*)?) => {
        tracing::info!(op = $op, $($($field)*,)? "{} started", $op)
    };
}

#[macro_export]
macro_rules! log_operation_success {
    ($op:expr $(, $($field:tt)*)?) => {
        tracing::info!(op = $op, $($($field)*,)? "{} succeeded", $op)
    };
}

#[macro_export]
macro_rules! log_operation_error {
    ($op:expr, $error:expr $(, $($field:tt)*)?) => {
        tracing::error!(op = $op, error = %$error, $($($field)*,)? "{} failed", $op)
    };
}
