use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::chroot::ChrootSession;
use crate::pipeline::{BuildContext, Stage, StageStatus};
use crate::preseed::hash_password;

/// Groups the operator joins, when the rootfs defines them.
const OPERATOR_GROUPS: &[&str] = &["sudo", "dialout", "audio", "plugdev"];

/// Members of [`OPERATOR_GROUPS`] that exist in the rootfs `/etc/group`.
pub fn supplementary_groups(rootfs: &Path) -> Vec<&'static str> {
    let defined: Vec<String> = fs::read_to_string(rootfs.join("etc/group"))
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.split(':').next())
        .map(str::to_string)
        .collect();
    OPERATOR_GROUPS
        .iter()
        .copied()
        .filter(|g| defined.iter().any(|d| d == g))
        .collect()
}

/// Creates the operator account and sets its password.
pub struct User;

impl Stage for User {
    fn name(&self) -> &'static str {
        "user"
    }

    fn requires_chroot(&self) -> bool {
        true
    }

    fn apply(&self, ctx: &BuildContext<'_>, chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let op = &ctx.config.operator;
        let Some(username) = op.username.as_deref() else {
            return Ok(StageStatus::Skipped("no username configured".into()));
        };
        let chroot = chroot.context("user setup needs a mounted chroot")?;

        let exists = chroot
            .command("id")?
            .args(["-u", username])
            .allow_fail()
            .run()?
            .success();
        if exists {
            info!(user = username, "operator account already present");
        } else {
            let groups = supplementary_groups(ctx.rootfs());
            let mut useradd = chroot
                .command("useradd")?
                .args(["-m", "-s", "/bin/bash"]);
            if let Some(name) = op.fullname.as_deref() {
                useradd = useradd.args(["-c", name]);
            }
            if !groups.is_empty() {
                useradd = useradd.args(["-G", groups.join(",").as_str()]);
            }
            useradd
                .arg(username)
                .error_msg(format!("Failed to create user {}", username))
                .run()?;
            info!(user = username, groups = %groups.join(","), "operator account created");
        }

        if let Some(password) = op.password.as_deref() {
            let hash = hash_password(password)?;
            chroot
                .command("chpasswd")?
                .arg("-e")
                .stdin_bytes(format!("{}:{}\n", username, hash))
                .error_msg(format!("Failed to set password for {}", username))
                .run()?;
        }
        Ok(StageStatus::Applied)
    }
}
