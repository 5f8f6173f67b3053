//! Clean command - removes build artifacts.

use anyhow::Result;
use std::path::Path;

use crate::chroot;
use crate::config::BuildConfig;
use crate::lock::WorkLock;

/// Clean target for the clean command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanTarget {
    /// Extracted trees (default; keeps downloads and images)
    Work,
    /// Finished images
    Output,
    /// Downloaded base image and payloads
    Cache,
    /// Everything above
    All,
}

fn remove_dir(label: &str, dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    println!("Removing {} ({})...", label, dir.display());
    chroot::remove_unmounted_tree(dir)?;
    Ok(true)
}

/// Execute the clean command.
pub fn cmd_clean(config: &BuildConfig, target: CleanTarget) -> Result<()> {
    // Refuse while a build owns the working directory.
    let _lock = if config.work_dir.exists() {
        Some(WorkLock::try_acquire(&config.work_dir)?)
    } else {
        None
    };

    let mut cleaned = false;
    if matches!(target, CleanTarget::Work | CleanTarget::All) {
        cleaned |= remove_dir("image tree", &config.iso_tree())?;
        cleaned |= remove_dir("root filesystem", &config.rootfs())?;
    }
    if matches!(target, CleanTarget::Output | CleanTarget::All) {
        cleaned |= remove_dir("output", &config.output_dir)?;
    }
    if matches!(target, CleanTarget::Cache | CleanTarget::All) {
        cleaned |= remove_dir("cache", &config.cache_dir)?;
    }

    if cleaned {
        println!("Clean complete.");
    } else {
        println!("Nothing to clean.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliOverrides;
    use std::collections::HashMap;
    use std::fs;

    fn config(dir: &Path) -> BuildConfig {
        BuildConfig::from_vars(dir, &HashMap::new(), &CliOverrides::default()).unwrap()
    }

    #[test]
    fn test_work_clean_keeps_cache_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        for d in [cfg.iso_tree(), cfg.rootfs(), cfg.output_dir.clone(), cfg.cache_dir.clone()] {
            fs::create_dir_all(&d).unwrap();
        }
        cmd_clean(&cfg, CleanTarget::Work).unwrap();
        assert!(!cfg.iso_tree().exists());
        assert!(!cfg.rootfs().exists());
        assert!(cfg.output_dir.exists());
        assert!(cfg.cache_dir.exists());

        cmd_clean(&cfg, CleanTarget::All).unwrap();
        assert!(!cfg.output_dir.exists());
        assert!(!cfg.cache_dir.exists());
    }

    #[test]
    fn test_clean_refused_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        fs::create_dir_all(cfg.rootfs()).unwrap();
        let _held = WorkLock::try_acquire(&cfg.work_dir).unwrap();
        assert!(cmd_clean(&cfg, CleanTarget::Work).is_err());
        assert!(cfg.rootfs().exists());
    }
}
