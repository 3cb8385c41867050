//! Logging infrastructure - structured tracing for the bridge
//!
//! Design: uses `tracing` for structured, contextual logging with:
//! - levels from the `[logging]` config section, overridable per run
//! - output on stderr, since stdout belongs to make (and to captured Python
//!   output)
//! - optional JSON format and file output
//!
//! Environment overrides: `PYGNUMAKE_LOG_LEVEL`, `PYGNUMAKE_LOG_FILE`,
//! `PYGNUMAKE_LOG_JSON`, `PYGNUMAKE_LOG_SPANS`. `RUST_LOG`, when set, wins
//! over the level.

use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// Also write to this file
    pub log_path: Option<PathBuf>,
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            level: parse_level(&config.level).unwrap_or(Level::WARN),
            log_path: config.file.clone(),
            json_format: config.json,
            show_spans: false,
        }
    }

    /// Apply `PYGNUMAKE_LOG_*` from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        // PYGNUMAKE_LOG_LEVEL: trace, debug, info, warn, error
        if let Some(level) = lookup("PYGNUMAKE_LOG_LEVEL").as_deref().and_then(parse_level) {
            self.level = level;
        }

        if let Some(path) = lookup("PYGNUMAKE_LOG_FILE").filter(|p| !p.is_empty()) {
            self.log_path = Some(PathBuf::from(path));
        }

        if lookup("PYGNUMAKE_LOG_JSON").is_some() {
            self.json_format = true;
        }

        if lookup("PYGNUMAKE_LOG_SPANS").is_some() {
            self.show_spans = true;
        }

        self
    }

    /// Verbose config for debugging a makefile
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: None,
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging with custom configuration. Only the first call has any
/// effect; a subscriber installed by someone else is left alone.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("pygnumake={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let text_layer = (!config.json_format).then(|| {
            fmt::layer()
                .with_writer(io::stderr)
                .with_span_events(span_events.clone())
                .with_target(true)
        });

        let json_layer = config.json_format.then(|| {
            fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_span_events(span_events.clone())
        });

        let file_layer = config.log_path.as_deref().and_then(file_appender).map(|appender| {
            fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_span_events(span_events)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
        });

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(text_layer)
            .with(json_layer)
            .with(file_layer)
            .try_init();
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

fn file_appender(path: &Path) -> Option<RollingFileAppender> {
    let file_name = path.file_name()?.to_str()?;
    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(directory)
        .ok()
}

/// Log a failed bootstrap step
pub fn log_setup_failure(stage: &str, error: &dyn std::fmt::Display) {
    tracing::error!(
        event = "setup_failed",
        stage = stage,
        error = %error,
        "Bridge setup failed"
    );
}
