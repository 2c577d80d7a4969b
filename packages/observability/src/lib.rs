//! # Observability
//!
//! Logging setup shared by Taproom binaries.
//!
//! Services call `observability::init()` once at startup and use standard
//! `tracing` macros everywhere else. Where the lines end up is decided here:
//!
//! - stderr, compact human-readable format (`also_stderr`)
//! - a JSONL file, one object per event (`log_path`)
//!
//! Fields recorded on spans are copied into every JSONL line emitted inside
//! them, so `tail -f worker.jsonl | jq 'select(.fields.request_id == "...")'`
//! follows a single request.
//!
//! ## Usage
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "taproom-worker".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! })?;
//! ```

mod json_layer;
mod writer;

pub use json_layer::{JsonLayer, LogEntry};
pub use writer::LogFileWriter;

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every JSONL line.
    pub service_name: String,

    /// Default filter (e.g. "debug", "info,taproom=trace").
    /// Overridden by `RUST_LOG` when set.
    pub default_level: String,

    /// Append JSONL to this file.
    pub log_path: Option<PathBuf>,

    /// Emit compact lines to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Initialize logging to stderr with default settings.
pub fn init(service_name: &str) -> io::Result<()> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        also_stderr: true,
        ..Default::default()
    })
}

/// Initialize logging with custom configuration.
///
/// Fails if the log file cannot be opened or a global subscriber is
/// already installed.
pub fn init_with_config(config: LogConfig) -> io::Result<()> {
    let filter = build_filter(&config.default_level);

    let stderr_layer = config.also_stderr.then(|| {
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .compact()
    });

    let json_layer = match &config.log_path {
        Some(path) => {
            let writer = LogFileWriter::open(path)?;
            Some(JsonLayer::new(config.service_name.clone(), writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| io::Error::other(e.to_string()))
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Re-export Level for advanced filtering.
pub use tracing::Level;
