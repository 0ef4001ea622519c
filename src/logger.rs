use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt};

pub const LOG_FILE: &str = "emit.log";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// `EnvFilter` directive for this level. There is no tracing level above
    /// error, so critical filters like error.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Critical => "critical",
            other => other.directive(),
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub log_level: LogLevel,
    /// Daily-rolling JSON log files go here when set.
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>) -> Self {
        Self { log_level, log_dir }
    }

    /// `RUST_LOG` wins over the configured level when it is set.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_level.directive()))
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
        }
    }
}

/// Install the global subscriber: pretty output on stdout, plus JSON lines
/// to `<log_dir>/emit.log.<date>` when a log directory is configured.
///
/// Keep the returned guard alive for as long as the file layer should flush.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let stdout_layer = tracing_fmt::layer()
        .with_thread_names(true)
        .with_filter(config.env_filter());

    let Some(dir) = &config.log_dir else {
        Registry::default().with(stdout_layer).try_init()?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(config.env_filter());

    Registry::default()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(Some(guard))
}
