//! Operator backup archives carried onto the image for restore on first boot.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::chroot::ChrootSession;
use crate::config::BuildConfig;
use crate::pipeline::{BuildContext, Stage, StageStatus};

/// Restore directory inside the rootfs.
pub const RESTORE_DIR: &str = "opt/emcomm-tools/restore";

const ARCHIVE_SUFFIXES: &[&str] = &[".tar.gz", ".tgz", ".tar"];

/// Backup archives directly inside `dir`, sorted by name.
pub fn find_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if path.is_file() && ARCHIVE_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn same_contents(a: &Path, b: &Path) -> bool {
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(ma), Ok(mb)) if ma.len() == mb.len() => {
            matches!((fs::read(a), fs::read(b)), (Ok(x), Ok(y)) if x == y)
        }
        _ => false,
    }
}

pub struct Backups;

impl Stage for Backups {
    fn name(&self) -> &'static str {
        "backups"
    }

    fn enabled(&self, config: &BuildConfig) -> bool {
        !config.minimal
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let Some(source) = &ctx.config.backup_dir else {
            return Ok(StageStatus::Skipped("no backup directory configured".into()));
        };
        if !source.is_dir() {
            bail!("backup directory {} does not exist", source.display());
        }
        let archives = find_archives(source)?;
        if archives.is_empty() {
            return Ok(StageStatus::Skipped(format!("no archives in {}", source.display())));
        }

        let dest_dir = ctx.rootfs().join(RESTORE_DIR);
        fs::create_dir_all(&dest_dir)
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
        for archive in &archives {
            let Some(name) = archive.file_name() else { continue };
            let dest = dest_dir.join(name);
            if same_contents(archive, &dest) {
                continue;
            }
            fs::copy(archive, &dest)
                .with_context(|| format!("Failed to copy {} into the image", archive.display()))?;
        }
        info!(count = archives.len(), dest = RESTORE_DIR, "backup archives staged");
        Ok(StageStatus::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::steps::testutil::{snapshot, Scratch};

    #[test]
    fn test_copies_archives_only() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("home.tar.gz"), b"home").unwrap();
        fs::write(src.path().join("winlink.tgz"), b"pat").unwrap();
        fs::write(src.path().join("notes.txt"), b"skip").unwrap();
        let dir = src.path().to_string_lossy().into_owned();
        let s = Scratch::new(&[("EMCOMM_BACKUP_DIR", dir.as_str())]);

        assert_eq!(Backups.apply(&s.ctx(), None).unwrap(), StageStatus::Applied);
        let restore = s.rootfs().join(RESTORE_DIR);
        assert_eq!(fs::read(restore.join("home.tar.gz")).unwrap(), b"home");
        assert!(restore.join("winlink.tgz").is_file());
        assert!(!restore.join("notes.txt").exists());

        let once = snapshot(s.rootfs());
        Backups.apply(&s.ctx(), None).unwrap();
        assert_eq!(once, snapshot(s.rootfs()));
    }

    #[test]
    fn test_unconfigured_and_minimal() {
        let s = Scratch::new(&[]);
        assert!(matches!(Backups.apply(&s.ctx(), None).unwrap(), StageStatus::Skipped(_)));
        let minimal = Scratch::new(&[("EMCOMM_MINIMAL", "1")]);
        assert!(!Backups.enabled(&minimal.config));
    }

    #[test]
    fn test_missing_source_dir_fails() {
        let s = Scratch::new(&[("EMCOMM_BACKUP_DIR", "/nonexistent/emcomm-backups")]);
        assert!(Backups.apply(&s.ctx(), None).is_err());
    }
}
