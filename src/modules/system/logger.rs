use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().to_rfc3339())
    }
}

pub fn log_dir(data_path: &Path) -> Result<PathBuf, String> {
    let dir = data_path.join("logs");
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| format!("Failed to create log directory: {}", e))?;
    }
    Ok(dir)
}

/// Installs the process-wide subscriber: console output plus a non-blocking
/// daily-rolling file under `<data_path>/logs`. Must run before any task is
/// spawned; later calls are no-ops.
pub fn init_logger(data_path: &Path) {
    let dir = match log_dir(data_path) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to initialize log directory: {}", e);
            return;
        }
    };

    let file_appender = tracing_appender::rolling::daily(dir, "keysweep.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_level(true)
        .with_timer(LocalTimer);
    let file_layer = fmt::Layer::new()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_timer(LocalTimer);
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();
    // The appender guard must outlive the process or buffered lines are lost.
    std::mem::forget(guard);

    info!("Log system initialized (console + file persistence)");
    if let Err(e) = cleanup_old_logs(data_path, 7) {
        warn!("Failed to cleanup old logs: {}", e);
    }
}

pub fn cleanup_old_logs(data_path: &Path, days_to_keep: u64) -> Result<usize, String> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let dir = log_dir(data_path)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("Failed to get system time: {}", e))?
        .as_secs();
    let cutoff = now.saturating_sub(days_to_keep * 24 * 60 * 60);

    let entries = fs::read_dir(&dir).map_err(|e| format!("Failed to read log directory: {}", e))?;
    let mut deleted = 0usize;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(metadata) = fs::metadata(&path) else {
            continue;
        };
        let modified = metadata
            .modified()
            .ok()
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(now);
        if modified < cutoff {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to delete old log file {:?}: {}", path, e);
            } else {
                deleted += 1;
                info!("Deleted old log file: {:?}", path.file_name());
            }
        }
    }

    if deleted > 0 {
        info!("Log cleanup completed: deleted {} file(s)", deleted);
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_dir_is_created_under_data_path() {
        let base = std::env::temp_dir().join(format!(".keysweep-logtest-{}", std::process::id()));
        let dir = log_dir(&base).expect("log dir");
        assert!(dir.ends_with("logs"));
        assert!(dir.exists());
        let _ = fs::remove_dir_all(&base);
    }
}
