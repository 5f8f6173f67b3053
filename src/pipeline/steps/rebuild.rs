//! Final stages: recompress the root filesystem, then regenerate the image.

use anyhow::{Context, Result};
use tracing::info;

use crate::artifact::{build_iso, rebuild_squashfs, write_filesystem_size, write_md5sums};
use crate::chroot::ChrootSession;
use crate::error::ErrorClass;
use crate::pipeline::{BuildContext, Stage, StageStatus};

pub struct RootfsRebuild;

impl Stage for RootfsRebuild {
    fn name(&self) -> &'static str {
        "rootfs-rebuild"
    }

    fn failure_class(&self) -> Option<ErrorClass> {
        Some(ErrorClass::ImageRebuild)
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let squashfs = &ctx.image.squashfs;
        rebuild_squashfs(ctx.rootfs(), squashfs)?;
        let size = write_filesystem_size(ctx.rootfs(), &squashfs.with_extension("size"))?;
        info!(bytes = size, "filesystem.size updated");
        Ok(StageStatus::Applied)
    }
}

pub struct ImageRebuild;

impl Stage for ImageRebuild {
    fn name(&self) -> &'static str {
        "image-rebuild"
    }

    fn failure_class(&self) -> Option<ErrorClass> {
        Some(ErrorClass::ImageRebuild)
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        write_md5sums(ctx.iso_tree())?;
        let output = ctx.output_image();
        build_iso(ctx.iso_tree(), ctx.base_image, &output, &ctx.release.volume_label())
            .with_context(|| format!("Failed to generate {}", output.display()))?;
        Ok(StageStatus::Applied)
    }
}
