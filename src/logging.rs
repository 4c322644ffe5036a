//! Process-wide `tracing` setup.
//!
//! Always logs to stdout. When the log directory can be created, a plain-text
//! copy also goes to `helmet-watch.<date>.log` there, rotated daily with two
//! weeks kept. Directory: `HELMET_WATCH_LOG_DIR`, else
//! `<data dir>/helmet-watch/logs`. Filter: `RUST_LOG`, then
//! `HELMET_WATCH_LOG_LEVEL`, then `info`.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LEVEL_VAR: &str = "HELMET_WATCH_LOG_LEVEL";
const DIR_VAR: &str = "HELMET_WATCH_LOG_DIR";
const KEEP_FILES: usize = 14;

/// Directory of the file sink, once installed (`None`: stdout only).
static INSTALLED: OnceLock<Option<PathBuf>> = OnceLock::new();
/// Flushes the file writer at exit.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Idempotent; returns the file log
/// directory when file logging is active.
pub fn init_logging() -> Option<&'static Path> {
    INSTALLED.get_or_init(install).as_deref()
}

fn install() -> Option<PathBuf> {
    let filter = filter_from(
        env::var("RUST_LOG").ok().as_deref(),
        env::var(LEVEL_VAR).ok().as_deref(),
    );
    let dir = env::var_os(DIR_VAR).map(PathBuf::from).unwrap_or_else(default_dir);

    let (file_layer, file_dir) = match file_writer(&dir) {
        Some((writer, guard)) => {
            FILE_GUARD.set(guard).ok();
            let layer = fmt::layer()
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer);
            (Some(layer), Some(dir))
        }
        None => (None, None),
    };
    let stdout_layer = fmt::layer().with_timer(UtcTime::rfc_3339());

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
    if let Err(e) = installed {
        eprintln!("[helmet-watch] tracing subscriber not installed: {}", e);
        return None;
    }

    match &file_dir {
        Some(d) => info!(dir = %d.display(), "File logging enabled, rotating daily"),
        None => warn!("File logging unavailable, stdout only"),
    }
    file_dir
}

fn default_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(env::temp_dir)
        .join("helmet-watch")
        .join("logs")
}

fn file_writer(dir: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    let appender = std::fs::create_dir_all(dir).map_err(|e| e.to_string()).and_then(|_| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("helmet-watch")
            .filename_suffix("log")
            .max_log_files(KEEP_FILES)
            .build(dir)
            .map_err(|e| e.to_string())
    });
    match appender {
        Ok(appender) => Some(tracing_appender::non_blocking(appender)),
        Err(e) => {
            eprintln!("[helmet-watch] cannot log to {}: {}", dir.display(), e);
            None
        }
    }
}

/// First directive set that parses wins; blank values are skipped.
fn filter_from(rust_log: Option<&str>, level: Option<&str>) -> EnvFilter {
    [rust_log, level]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .find_map(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
