//! Global `tracing` subscriber for the deskpilot binary.
//!
//! `DESKPILOT_LOG_FILTER` replaces the computed filter entirely. At trace
//! level the chattiest network crates are held at info unless
//! `DESKPILOT_TRACE_DEPS` is set.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "DESKPILOT_LOG_FILTER";
const TRACE_DEPS_ENV: &str = "DESKPILOT_TRACE_DEPS";

const OWN_TARGETS: &[&str] = &["deskpilot_core", "deskpilot"];

const NOISY_DEPENDENCIES: &[&str] = &[
    "hyper",
    "hyper_util",
    "h2",
    "reqwest",
    "rustls",
    "tungstenite",
    "tokio_tungstenite",
    "mio",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Filter directives for this level. Debug and trace only raise our own
    /// crates; everything else stays at info.
    fn directives(self, quiet_dependencies: bool) -> String {
        let mut directives = match self {
            LogLevel::Debug | LogLevel::Trace => {
                let mut parts = vec!["info".to_string()];
                parts.extend(
                    OWN_TARGETS
                        .iter()
                        .map(|target| format!("{target}={}", self.as_str())),
                );
                parts
            }
            other => vec![other.as_str().to_string()],
        };
        if self == LogLevel::Trace && quiet_dependencies {
            directives.extend(NOISY_DEPENDENCIES.iter().map(|dep| format!("{dep}=info")));
        }
        directives.join(",")
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Calls after the first success are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let override_filter = std::env::var(FILTER_ENV).ok();
    let quiet_dependencies = override_filter.is_none()
        && !super::flag(TRACE_DEPS_ENV).unwrap_or(false)
        && config.level == LogLevel::Trace;
    let filter = match override_filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::new(config.level.directives(quiet_dependencies)),
    };

    let (writer, guard) = writer_for(config.file.as_deref())?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    if quiet_dependencies {
        tracing::info!(
            "dependency traces held at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to see them"
        );
    }
    Ok(())
}

fn writer_for(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
    match file {
        Some(path) => Ok(tracing_appender::non_blocking(open_log_file(path)?)),
        None => Ok(tracing_appender::non_blocking(std::io::stderr())),
    }
}

fn open_log_file(path: &Path) -> Result<File, InitError> {
    let io_error = |source: std::io::Error| InitError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error)
}
