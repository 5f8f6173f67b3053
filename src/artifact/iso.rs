//! Bootable image regeneration.
//!
//! The base image's El Torito and GPT/MBR boot records are replayed rather
//! than reconstructed: `xorriso -report_el_torito as_mkisofs` prints the
//! exact mkisofs options that recreate them, and those are fed back into
//! `xorriso -as mkisofs` with our own volume label.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cache::sha256_file;
use crate::process::Cmd;

/// Options from the report that we always set ourselves.
const OWNED_OPTIONS: &[&str] = &["-V", "-volid"];

/// Parse `-report_el_torito as_mkisofs` output into argument tokens.
///
/// The report quotes values shell-style, one option group per line. The
/// original volume label and modification date are dropped.
pub fn parse_boot_report(report: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    for line in report.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts = shlex::split(line)
            .with_context(|| format!("Unparseable boot record line: {}", line))?;
        tokens.extend(parts);
    }

    let mut flags = Vec::with_capacity(tokens.len());
    let mut iter = tokens.into_iter();
    while let Some(token) = iter.next() {
        if OWNED_OPTIONS.contains(&token.as_str()) {
            iter.next();
            continue;
        }
        if token.starts_with("--modification-date=") {
            continue;
        }
        flags.push(token);
    }
    Ok(flags)
}

/// Boot-record options of `base_image`.
pub fn boot_flags(base_image: &Path) -> Result<Vec<String>> {
    let result = Cmd::new("xorriso")
        .arg("-indev")
        .arg_path(base_image)
        .args(["-report_el_torito", "as_mkisofs"])
        .error_msg(format!("xorriso could not read boot records of {}", base_image.display()))
        .run()?;
    let flags = parse_boot_report(&result.stdout)?;
    if flags.is_empty() {
        bail!("{} carries no boot records", base_image.display());
    }
    debug!(?flags, "replayed boot options");
    Ok(flags)
}

/// Sidecar checksum path: `<image>.sha256`.
pub fn checksum_path(image: &Path) -> PathBuf {
    let mut name = image.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".sha256");
    image.with_file_name(name)
}

/// Build the image from `iso_tree` into `output`.
///
/// xorriso writes `<output>.tmp`, which is renamed over `output` only after
/// it completes; a `.sha256` sidecar is written last.
pub fn build_iso(iso_tree: &Path, base_image: &Path, output: &Path, label: &str) -> Result<PathBuf> {
    let flags = boot_flags(base_image)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut tmp_name = output.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = output.with_file_name(tmp_name);
    if tmp.exists() {
        fs::remove_file(&tmp).with_context(|| format!("Failed to remove {}", tmp.display()))?;
    }

    info!(output = %output.display(), %label, "generating bootable image");
    Cmd::new("xorriso")
        .args(["-as", "mkisofs"])
        .args(["-r", "-J", "-joliet-long"])
        .args(["-V", label])
        .arg("-o")
        .arg_path(&tmp)
        .args(&flags)
        .arg_path(iso_tree)
        .error_msg("xorriso failed to write the image. Install: sudo apt install xorriso")
        .run()?;

    fs::rename(&tmp, output)
        .with_context(|| format!("Failed to move {} to {}", tmp.display(), output.display()))?;

    let digest = sha256_file(output)?;
    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sidecar = checksum_path(output);
    fs::write(&sidecar, format!("{}  {}\n", digest, file_name))
        .with_context(|| format!("Failed to write {}", sidecar.display()))?;

    let size = fs::metadata(output).map(|m| m.len()).unwrap_or(0);
    info!(output = %output.display(), mb = size / 1024 / 1024, sha256 = %digest, "image written");
    Ok(output.to_path_buf())
}
