//! Log output: leveled console lines on stderr, and for builds a plain-text
//! copy in `logs/build-<timestamp>.log` that survives a failed run.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// `build-YYYYmmdd-HHMMSS.log` for the current local time.
pub fn log_file_name() -> String {
    format!("build-{}.log", chrono::Local::now().format("%Y%m%d-%H%M%S"))
}

/// Console logging only.
pub fn init_console() {
    let _ = Registry::default()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

/// Console plus a log file under `log_dir`. Returns the file's path.
pub fn init_with_file(log_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let path = log_dir.join(log_file_name());
    let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;

    Registry::default()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()
        .context("Logging was already initialised")?;
    Ok(path)
}

/// Logging for `build`. A dry run stays on the console and leaves
/// `log_dir` untouched; a real build also gets a log file.
pub fn init_for_build(log_dir: &Path, dry_run: bool) -> Result<Option<PathBuf>> {
    if dry_run {
        init_console();
        return Ok(None);
    }
    init_with_file(log_dir).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name_shape() {
        let re = regex::Regex::new(r"^build-\d{8}-\d{6}\.log$").unwrap();
        assert!(re.is_match(&log_file_name()));
    }

    #[test]
    fn test_dry_run_creates_no_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("logs");
        assert!(init_for_build(&log_dir, true).unwrap().is_none());
        assert!(!log_dir.exists());
    }
}
