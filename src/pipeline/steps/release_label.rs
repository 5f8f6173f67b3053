//! Stamp the release identity into the image.

use anyhow::Result;

use crate::chroot::ChrootSession;
use crate::common::write_if_changed;
use crate::pipeline::{BuildContext, Stage, StageStatus};

/// `.disk/info` in the image tree.
pub const DISK_INFO: &str = ".disk/info";
/// Release record inside the root filesystem.
pub const RELEASE_FILE: &str = "etc/emcomm-release";

pub struct ReleaseLabel;

/// `KEY=value` lines describing the release.
pub fn release_record(ctx: &BuildContext<'_>) -> String {
    let r = ctx.release;
    let mut out = String::new();
    out.push_str(&format!("ET_RELEASE={}\n", r.tag));
    out.push_str(&format!("ET_RELEASE_NAME=\"{}\"\n", r.name.replace('"', "'")));
    if let Some(date) = &r.published_at {
        out.push_str(&format!("ET_RELEASE_DATE={}\n", date));
    }
    out.push_str(&format!("ET_BUILD_MINIMAL={}\n", ctx.config.minimal));
    out
}

impl Stage for ReleaseLabel {
    fn name(&self) -> &'static str {
        "release-label"
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let info = format!("{}\n", ctx.release.describe());
        write_if_changed(&ctx.iso_tree().join(DISK_INFO), info.as_bytes(), Some(0o644))?;
        write_if_changed(
            &ctx.rootfs().join(RELEASE_FILE),
            release_record(ctx).as_bytes(),
            Some(0o644),
        )?;
        Ok(StageStatus::Applied)
    }
}
