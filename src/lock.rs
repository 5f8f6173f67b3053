//! Exclusive lock on the working directory.
//!
//! Two builds sharing one work tree would unpack over each other and stack
//! chroot mounts, so a run holds `flock(LOCK_EX)` on `<work>/.lock` for its
//! whole lifetime. The lock is released when the [`WorkLock`] is dropped or
//! the process exits.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::BuildError;

#[derive(Debug)]
pub struct WorkLock {
    file: File,
    path: PathBuf,
}

impl WorkLock {
    pub const FILE_NAME: &'static str = ".lock";

    /// Take the lock without blocking. Fails with [`BuildError::Locked`]
    /// when another process holds it.
    pub fn try_acquire(work_dir: &Path) -> Result<Self> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;
        let path = work_dir.join(Self::FILE_NAME);
        let mut file = File::create(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                // Informational only; the flock is what matters.
                let _ = writeln!(file, "{}", std::process::id());
                info!(path = %path.display(), "acquired work directory lock");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!(path = %path.display(), "work directory lock is held");
                Err(BuildError::Locked(work_dir.display().to_string()).into())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
