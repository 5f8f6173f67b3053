//! Base image extraction.
//!
//! Unpacks the installer image's file tree with 7z, then its compressed root
//! filesystem with unsquashfs, and makes both trees writable so later stages
//! can modify them.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chroot;
use crate::process::Cmd;

/// Where the root filesystem lives inside an Ubuntu live image, in order of
/// preference.
pub const SQUASHFS_CANDIDATES: &[&str] = &[
    "casper/filesystem.squashfs",
    "casper/minimal.squashfs",
    "casper/ubuntu-server-minimal.squashfs",
];

/// Paths produced by a successful extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    pub iso_tree: PathBuf,
    pub rootfs: PathBuf,
    /// The squashfs inside `iso_tree` that `rootfs` came from.
    pub squashfs: PathBuf,
}

/// Locate the root filesystem image inside an extracted tree.
pub fn find_squashfs(iso_tree: &Path) -> Result<PathBuf> {
    SQUASHFS_CANDIDATES
        .iter()
        .map(|rel| iso_tree.join(rel))
        .find(|p| p.is_file())
        .with_context(|| {
            format!(
                "Could not find a root filesystem image in {} (looked for {})",
                iso_tree.display(),
                SQUASHFS_CANDIDATES.join(", ")
            )
        })
}

/// Unpack `image` into `iso_tree` and its root filesystem into `rootfs`.
///
/// Leftover trees from an earlier run are removed first.
pub fn extract_image(image: &Path, iso_tree: &Path, rootfs: &Path) -> Result<ExtractedImage> {
    if !image.is_file() {
        bail!("Base image not found at {}", image.display());
    }

    for stale in [iso_tree, rootfs] {
        if stale.exists() {
            info!(path = %stale.display(), "removing stale work tree");
            chroot::remove_unmounted_tree(stale)?;
        }
    }

    info!(image = %image.display(), "extracting image contents with 7z");
    fs::create_dir_all(iso_tree)
        .with_context(|| format!("Failed to create {}", iso_tree.display()))?;
    Cmd::new("7z")
        .args(["x", "-y"])
        .arg_path(image)
        .arg(format!("-o{}", iso_tree.display()))
        .error_msg("7z extraction failed. Install: sudo apt install p7zip-full")
        .run()?;

    // 7z exposes the El Torito images as files; the rebuilt image replays
    // them from the base image instead.
    let boot_images = iso_tree.join("[BOOT]");
    if boot_images.exists() {
        fs::remove_dir_all(&boot_images)
            .with_context(|| format!("Failed to remove {}", boot_images.display()))?;
    }

    let squashfs = find_squashfs(iso_tree)?;
    info!(squashfs = %squashfs.display(), "extracting root filesystem");

    if let Some(parent) = rootfs.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    // unsquashfs exits non-zero on xattr and device-node warnings, so judge
    // success by the result rather than the exit code.
    let result = Cmd::new("unsquashfs")
        .arg("-d")
        .arg_path(rootfs)
        .arg("-f")
        .arg_path(&squashfs)
        .allow_fail()
        .run()?;
    if !result.success() {
        if looks_like_rootfs(rootfs) {
            warn!(
                code = result.code(),
                stderr = result.stderr_trimmed(),
                "unsquashfs reported problems but the tree is populated"
            );
        } else {
            bail!(
                "unsquashfs failed. Install: sudo apt install squashfs-tools\n{}",
                result.stderr_trimmed()
            );
        }
    }

    let fixed = make_writable(iso_tree)? + make_writable(rootfs)?;
    debug!(entries = fixed, "added owner write permission");

    info!(rootfs = %rootfs.display(), "extraction complete");
    Ok(ExtractedImage {
        iso_tree: iso_tree.to_path_buf(),
        rootfs: rootfs.to_path_buf(),
        squashfs,
    })
}

/// A root filesystem has at least `etc` and `usr`.
pub fn looks_like_rootfs(dir: &Path) -> bool {
    dir.join("etc").is_dir() && dir.join("usr").is_dir()
}

/// Add the owner-write bit to every read-only file and directory under
/// `root`. Symlinks are left alone. Returns the number of entries changed.
pub fn make_writable(root: &Path) -> Result<usize> {
    let mut changed = 0;
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        let mut perms = meta.permissions();
        let mode = perms.mode();
        if mode & 0o200 == 0 {
            perms.set_mode(mode | 0o200);
            fs::set_permissions(entry.path(), perms).with_context(|| {
                format!("Failed to make {} writable", entry.path().display())
            })?;
            changed += 1;
        }
    }
    Ok(changed)
}
