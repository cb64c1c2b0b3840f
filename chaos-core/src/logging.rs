//! Tracing subscriber setup shared by the CLI and tests.
//!
//! Environment:
//! - `CHAOS_LOG`: filter directives, e.g. `info` or `chaos_core=debug`
//! - `CHAOS_LOG_FORMAT`: `pretty` (default) or `json`
//! - `CHAOS_LOG_FILE`: write logs to this file instead of the terminal

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_ENV: &str = "CHAOS_LOG";
pub const LOG_FORMAT_ENV: &str = "CHAOS_LOG_FORMAT";
pub const LOG_FILE_ENV: &str = "CHAOS_LOG_FILE";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("invalid log filter {directive:?}: {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("invalid log file path {0:?}")]
    InvalidPath(PathBuf),

    #[error("failed to install subscriber: {0}")]
    Init(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" | "jsonl" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum LogTarget {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    level: String,
    format: LogFormat,
    target: LogTarget,
    file: Option<PathBuf>,
}

impl LogConfig {
    /// Read the `CHAOS_LOG*` variables, falling back to `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        Self::from_lookup(default_level, |key| std::env::var(key).ok())
    }

    fn from_lookup(default_level: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup(LOG_ENV)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        let format = lookup(LOG_FORMAT_ENV)
            .map(|v| LogFormat::parse(&v))
            .unwrap_or_default();
        let file = lookup(LOG_FILE_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Self {
            level,
            format,
            target: LogTarget::Stdout,
            file,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Log to stderr so stdout stays free for command output.
    pub fn with_stderr(mut self) -> Self {
        self.target = LogTarget::Stderr;
        self
    }

    pub fn with_json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }
}

/// Install the global subscriber. Keep the returned guards alive for the
/// life of the process or buffered file output is lost.
pub fn init_logging(config: &LogConfig) -> Result<Vec<WorkerGuard>, LogError> {
    let filter = EnvFilter::try_new(&config.level).map_err(|e| LogError::InvalidFilter {
        directive: config.level.clone(),
        reason: e.to_string(),
    })?;

    let mut guards = Vec::new();
    let writer = match &config.file {
        Some(path) => {
            let name = path
                .file_name()
                .ok_or_else(|| LogError::InvalidPath(path.clone()))?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), PathBuf::from);
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(name.to_string_lossy())
                .build(&dir)
                .map_err(|e| LogError::Init(format!("opening {}: {e}", path.display())))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            BoxMakeWriter::new(writer)
        }
        None => match config.target {
            LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
        },
    };

    let layer = match config.format {
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| LogError::Init(e.to_string()))?;

    Ok(guards)
}

/// Route engine logs through the test harness. Safe to call from every test.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("chaos_core=debug"));
    let _ = fmt().with_test_writer().with_env_filter(filter).try_init();
}
