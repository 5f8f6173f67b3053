//! Root filesystem recompression and the metadata files that describe it.

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use crate::process::Cmd;

/// Files excluded from `md5sum.txt`.
const MD5_EXCLUDES: &[&str] = &["md5sum.txt", "boot.catalog"];

/// Recompress `rootfs` over `squashfs`. The new image is written beside the
/// old one and renamed into place, so a failure leaves the original intact.
pub fn rebuild_squashfs(rootfs: &Path, squashfs: &Path) -> Result<u64> {
    let tmp = sibling_tmp(squashfs);
    if tmp.exists() {
        fs::remove_file(&tmp).with_context(|| format!("Failed to remove {}", tmp.display()))?;
    }

    info!(rootfs = %rootfs.display(), "recompressing root filesystem (xz)");
    Cmd::new("mksquashfs")
        .arg_path(rootfs)
        .arg_path(&tmp)
        .args(["-comp", "xz"])
        .args(["-b", "1M"])
        .arg("-noappend")
        .arg("-no-progress")
        .error_msg("mksquashfs failed. Install: sudo apt install squashfs-tools")
        .run()?;

    fs::rename(&tmp, squashfs)
        .with_context(|| format!("Failed to move {} into place", squashfs.display()))?;

    let size = fs::metadata(squashfs)
        .with_context(|| format!("Failed to stat {}", squashfs.display()))?
        .len();
    info!(path = %squashfs.display(), mb = size / 1024 / 1024, "root filesystem image written");
    Ok(size)
}

fn sibling_tmp(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Apparent size in bytes of every regular file under `root`.
pub fn tree_size(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?
                .len();
        }
    }
    Ok(total)
}

/// Write `filesystem.size` next to the squashfs. The installer reads it to
/// check the target has room.
pub fn write_filesystem_size(rootfs: &Path, size_file: &Path) -> Result<u64> {
    let size = tree_size(rootfs)?;
    fs::write(size_file, format!("{}\n", size))
        .with_context(|| format!("Failed to write {}", size_file.display()))?;
    Ok(size)
}

fn md5_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Regenerate `md5sum.txt` at the root of `iso_tree` in the
/// `<hash>  ./<path>` form used by the casper integrity check.
pub fn write_md5sums(iso_tree: &Path) -> Result<usize> {
    let target = iso_tree.join("md5sum.txt");
    let tmp = iso_tree.join(".md5sum.txt.tmp");
    let mut out = File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;

    let mut count = 0;
    for entry in WalkDir::new(iso_tree).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", iso_tree.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(iso_tree).unwrap_or(entry.path());
        let rel_str = rel.to_string_lossy();
        if MD5_EXCLUDES.contains(&rel_str.as_ref()) || entry.path() == tmp {
            continue;
        }
        writeln!(out, "{}  ./{}", md5_file(entry.path())?, rel_str)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        count += 1;
    }
    out.flush()?;
    drop(out);

    fs::rename(&tmp, &target)
        .with_context(|| format!("Failed to move {} into place", target.display()))?;
    info!(files = count, "regenerated md5sum.txt");
    Ok(count)
}
