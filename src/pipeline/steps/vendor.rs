//! Vendor payload staging, installation and cleanup.
//!
//! The payload tarball is unpacked into the root filesystem, its installer
//! runs inside the chroot, and the staging copy is removed again before the
//! root filesystem is recompressed.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::chroot::ChrootSession;
use crate::config::{BuildConfig, OperatorInputs};
use crate::error::ErrorClass;
use crate::pipeline::{BuildContext, Stage, StageStatus};

/// Staging directory inside the root filesystem.
pub const VENDOR_STAGING: &str = "tmp/emcomm-vendor";
/// Installer entry point at the top of the payload.
pub const INSTALLER: &str = "install.sh";

const RESOLV_CONF: &str = "etc/resolv.conf";
const RESOLV_CONF_SAVED: &str = "etc/resolv.conf.emcomm-orig";

// =============================================================================
// vendor-payload
// =============================================================================

pub struct VendorPayload;

/// Unpack a gzip tarball into `dest`, flattening the single top-level
/// directory that GitHub source tarballs carry.
pub fn unpack_payload(tarball: &Path, dest: &Path) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    let tmp = parent.join(".emcomm-vendor-unpack");
    for stale in [tmp.as_path(), dest] {
        if stale.exists() {
            fs::remove_dir_all(stale).with_context(|| format!("Failed to remove {}", stale.display()))?;
        }
    }
    fs::create_dir_all(&tmp)?;

    let file = File::open(tarball).with_context(|| format!("Failed to open {}", tarball.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .unpack(&tmp)
        .with_context(|| format!("Failed to unpack {}", tarball.display()))?;

    let entries: Vec<PathBuf> = fs::read_dir(&tmp)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    let root = match entries.as_slice() {
        [only] if only.is_dir() && !tmp.join(INSTALLER).exists() => only.clone(),
        _ => tmp.clone(),
    };

    fs::rename(&root, dest)
        .with_context(|| format!("Failed to move payload to {}", dest.display()))?;
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    Ok(())
}

impl Stage for VendorPayload {
    fn name(&self) -> &'static str {
        "vendor-payload"
    }

    fn failure_class(&self) -> Option<ErrorClass> {
        Some(ErrorClass::Extraction)
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let staging = ctx.rootfs().join(VENDOR_STAGING);
        unpack_payload(ctx.payload, &staging)?;

        let installer = staging.join(INSTALLER);
        if !installer.is_file() {
            bail!("vendor payload has no top-level {}", INSTALLER);
        }
        let mut perms = fs::metadata(&installer)?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(&installer, perms)?;

        info!(staging = %staging.display(), "vendor payload staged");
        Ok(StageStatus::Applied)
    }
}

// =============================================================================
// vendor-install
// =============================================================================

/// How the vendor installer is driven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallMode {
    /// Every steerable input is known: closed stdin, answers via `ET_*`.
    Unattended,
    /// Some inputs are missing; the installer prompts on the terminal.
    Attended { missing: Vec<&'static str> },
}

impl InstallMode {
    pub fn for_operator(op: &OperatorInputs) -> Self {
        let inputs = [
            ("callsign", op.callsign.is_some()),
            ("grid square", op.grid_square.is_some()),
            ("operator name", op.fullname.is_some()),
            ("username", op.username.is_some()),
        ];
        let missing: Vec<&'static str> = inputs
            .iter()
            .filter(|(_, set)| !set)
            .map(|(name, _)| *name)
            .collect();
        if missing.is_empty() {
            InstallMode::Unattended
        } else {
            InstallMode::Attended { missing }
        }
    }
}

/// `ET_*` environment handed to the installer.
pub fn installer_env(config: &BuildConfig) -> Vec<(String, String)> {
    let op = &config.operator;
    let mut env = Vec::new();
    let mut push = |k: &str, v: &Option<String>| {
        if let Some(v) = v {
            env.push((k.to_string(), v.clone()));
        }
    };
    push("ET_CALLSIGN", &op.callsign);
    push("ET_GRID", &op.grid_square);
    push("ET_FULLNAME", &op.fullname);
    push("ET_USER", &op.username);
    if config.minimal {
        env.push(("ET_MINIMAL".into(), "1".into()));
    }
    env
}

/// Give the chroot working DNS. When the rootfs resolv.conf is a dangling
/// link (systemd-resolved stub), it is set aside and the host's copied in.
fn provide_resolv_conf(rootfs: &Path) -> Result<()> {
    let target = rootfs.join(RESOLV_CONF);
    let saved = rootfs.join(RESOLV_CONF_SAVED);
    let is_link = fs::symlink_metadata(&target).map_or(false, |m| m.file_type().is_symlink());
    if !is_link || target.exists() {
        return Ok(());
    }
    if fs::symlink_metadata(&saved).is_err() {
        fs::rename(&target, &saved)
            .with_context(|| format!("Failed to set aside {}", target.display()))?;
    } else {
        fs::remove_file(&target)?;
    }
    fs::copy("/etc/resolv.conf", &target).context("Failed to copy host resolv.conf")?;
    Ok(())
}

/// Undo [`provide_resolv_conf`].
fn restore_resolv_conf(rootfs: &Path) -> Result<()> {
    let target = rootfs.join(RESOLV_CONF);
    let saved = rootfs.join(RESOLV_CONF_SAVED);
    if fs::symlink_metadata(&saved).is_err() {
        return Ok(());
    }
    if fs::symlink_metadata(&target).is_ok() {
        fs::remove_file(&target).with_context(|| format!("Failed to remove {}", target.display()))?;
    }
    fs::rename(&saved, &target).with_context(|| format!("Failed to restore {}", target.display()))?;
    Ok(())
}

pub struct VendorInstall;

impl Stage for VendorInstall {
    fn name(&self) -> &'static str {
        "vendor-install"
    }

    fn failure_class(&self) -> Option<ErrorClass> {
        Some(ErrorClass::ChrootInstall)
    }

    fn requires_chroot(&self) -> bool {
        true
    }

    fn apply(&self, ctx: &BuildContext<'_>, chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let chroot = chroot.context("vendor install needs a mounted chroot")?;
        provide_resolv_conf(ctx.rootfs())?;

        let script = format!("cd /{} && ./{}", VENDOR_STAGING, INSTALLER);
        let cmd = chroot
            .command("/bin/bash")?
            .args(["-c", script.as_str()])
            .envs(installer_env(ctx.config))
            .error_msg("vendor installer failed");

        match InstallMode::for_operator(&ctx.config.operator) {
            InstallMode::Unattended => {
                info!("running vendor installer unattended");
                cmd.env("DEBIAN_FRONTEND", "noninteractive")
                    .stdin_null()
                    .run_interactive()?;
            }
            InstallMode::Attended { missing } => {
                warn!(
                    missing = %missing.join(", "),
                    "vendor installer will prompt for values that are not configured"
                );
                cmd.run_interactive()?;
            }
        }
        Ok(StageStatus::Applied)
    }
}

// =============================================================================
// vendor-cleanup
// =============================================================================

pub struct VendorCleanup;

impl Stage for VendorCleanup {
    fn name(&self) -> &'static str {
        "vendor-cleanup"
    }

    fn failure_class(&self) -> Option<ErrorClass> {
        Some(ErrorClass::ChrootInstall)
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let staging = ctx.rootfs().join(VENDOR_STAGING);
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .with_context(|| format!("Failed to remove {}", staging.display()))?;
        }
        restore_resolv_conf(ctx.rootfs())?;
        Ok(StageStatus::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::steps::testutil::{snapshot, Scratch};
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn write_payload(path: &Path, top: Option<&str>) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let enc = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(enc);
        let prefix = top.map(|t| format!("{}/", t)).unwrap_or_default();
        for (name, body) in [("install.sh", "#!/bin/bash\necho ok\n"), ("conf/a.conf", "x=1\n")] {
            let data = body.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{}{}", prefix, name), data)
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_payload_flattens_github_prefix() {
        let s = Scratch::new(&[]);
        write_payload(&s.payload, Some("thetechprepper-emcomm-tools-os-community-abc123"));
        VendorPayload.apply(&s.ctx(), None).unwrap();
        let staging = s.rootfs().join(VENDOR_STAGING);
        assert!(staging.join("install.sh").is_file());
        assert!(staging.join("conf/a.conf").is_file());
        let mode = fs::metadata(staging.join("install.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);
    }

    #[test]
    fn test_payload_without_prefix() {
        let s = Scratch::new(&[]);
        write_payload(&s.payload, None);
        VendorPayload.apply(&s.ctx(), None).unwrap();
        assert!(s.rootfs().join(VENDOR_STAGING).join("install.sh").is_file());
    }

    #[test]
    fn test_payload_idempotent() {
        let s = Scratch::new(&[]);
        write_payload(&s.payload, Some("top"));
        VendorPayload.apply(&s.ctx(), None).unwrap();
        let once = snapshot(s.rootfs());
        VendorPayload.apply(&s.ctx(), None).unwrap();
        assert_eq!(once, snapshot(s.rootfs()));
    }

    #[test]
    fn test_missing_payload_fails() {
        let s = Scratch::new(&[]);
        assert!(VendorPayload.apply(&s.ctx(), None).is_err());
        assert!(VendorPayload.fatal());
    }

    #[test]
    fn test_cleanup_removes_staging_and_is_idempotent() {
        let s = Scratch::new(&[]);
        write_payload(&s.payload, Some("top"));
        VendorPayload.apply(&s.ctx(), None).unwrap();
        VendorCleanup.apply(&s.ctx(), None).unwrap();
        assert!(!s.rootfs().join(VENDOR_STAGING).exists());
        VendorCleanup.apply(&s.ctx(), None).unwrap();
    }

    #[test]
    fn test_resolv_conf_round_trip() {
        let s = Scratch::new(&[]);
        let link = s.rootfs().join(RESOLV_CONF);
        std::os::unix::fs::symlink("../run/systemd/resolve/stub-resolv.conf", &link).unwrap();
        if !Path::new("/etc/resolv.conf").is_file() {
            return;
        }
        provide_resolv_conf(s.rootfs()).unwrap();
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_file());
        restore_resolv_conf(s.rootfs()).unwrap();
        assert_eq!(
            fs::read_link(&link).unwrap(),
            PathBuf::from("../run/systemd/resolve/stub-resolv.conf")
        );
    }

    #[test]
    fn test_install_mode() {
        let s = Scratch::new(&[
            ("EMCOMM_CALLSIGN", "kd7abc"),
            ("EMCOMM_GRID_SQUARE", "DN45"),
            ("EMCOMM_FULLNAME", "Pat"),
            ("EMCOMM_USERNAME", "pat"),
        ]);
        assert_eq!(InstallMode::for_operator(&s.config.operator), InstallMode::Unattended);

        let partial = Scratch::new(&[("EMCOMM_CALLSIGN", "kd7abc")]);
        match InstallMode::for_operator(&partial.config.operator) {
            InstallMode::Attended { missing } => {
                assert_eq!(missing, vec!["grid square", "operator name", "username"])
            }
            other => panic!("expected attended, got {:?}", other),
        }
    }

    #[test]
    fn test_installer_env_minimal_flag() {
        let s = Scratch::new(&[("EMCOMM_CALLSIGN", "kd7abc"), ("EMCOMM_MINIMAL", "true")]);
        let env = installer_env(&s.config);
        assert!(env.contains(&("ET_CALLSIGN".to_string(), "KD7ABC".to_string())));
        assert!(env.contains(&("ET_MINIMAL".to_string(), "1".to_string())));
    }

    #[test]
    fn test_install_requires_chroot() {
        let s = Scratch::new(&[]);
        assert!(VendorInstall.requires_chroot());
        assert!(VendorInstall.apply(&s.ctx(), None).is_err());
    }
}
