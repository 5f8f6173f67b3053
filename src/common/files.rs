//! File writes with parent directory creation.
//!
//! Customization stages must be idempotent, so the writers here compare
//! before writing and replace files atomically (temp file in the same
//! directory, then rename).

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.emcomm-tmp", name))
}

/// Replace `path` with `content` unless it already holds exactly that.
/// `mode` is applied to the new file; when `None`, an existing file's mode
/// is kept. Returns whether anything was written.
pub fn write_if_changed(path: &Path, content: &[u8], mode: Option<u32>) -> Result<bool> {
    let existing = fs::symlink_metadata(path).ok();
    let is_regular = existing.as_ref().map_or(false, |m| m.file_type().is_file());

    if is_regular {
        let current = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let mode_ok = match (mode, &existing) {
            (Some(want), Some(meta)) => meta.permissions().mode() & 0o7777 == want,
            _ => true,
        };
        if current == content && mode_ok {
            return Ok(false);
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let keep_mode = existing
        .as_ref()
        .filter(|_| is_regular)
        .map(|m| m.permissions().mode() & 0o7777);
    let tmp = tmp_sibling(path);
    fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Some(m) = mode.or(keep_mode) {
        fs::set_permissions(&tmp, fs::Permissions::from_mode(m))
            .with_context(|| format!("Failed to set mode on {}", tmp.display()))?;
    }
    // A symlink at the target (e.g. /etc/resolv.conf style) is replaced, not followed.
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(true)
}

/// Make sure `line` appears in the file at `path`, replacing the first line
/// for which `matches` is true, or appending. Returns whether the file changed.
pub fn ensure_line(path: &Path, line: &str, matches: impl Fn(&str) -> bool) -> Result<bool> {
    let current = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    let mut replaced = false;
    let mut lines: Vec<String> = Vec::new();
    for l in current.lines() {
        if !replaced && matches(l) {
            lines.push(line.to_string());
            replaced = true;
        } else if replaced && matches(l) {
            continue;
        } else {
            lines.push(l.to_string());
        }
    }
    if !replaced {
        lines.push(line.to_string());
    }

    let mut text = lines.join("\n");
    text.push('\n');
    write_if_changed(path, text.as_bytes(), None)
}
