//! Extract command - unpacks the cached base image for inspection.

use anyhow::Result;

use crate::cache::{ArtifactCache, ArtifactKind};
use crate::config::BuildConfig;
use crate::extract::extract_image;
use crate::lock::WorkLock;

use super::download::base_image_filename;

/// Execute the extract command.
pub fn cmd_extract(config: &BuildConfig) -> Result<()> {
    let _lock = WorkLock::try_acquire(&config.work_dir)?;
    let base_image = ArtifactCache::new(&config.cache_dir).ensure(
        ArtifactKind::BaseImage,
        &config.base_image_url,
        &base_image_filename(config)?,
    )?;

    println!("Extracting {}...", base_image.display());
    let image = extract_image(&base_image, &config.iso_tree(), &config.rootfs())?;
    println!("  image tree:      {}", image.iso_tree.display());
    println!("  root filesystem: {}", image.rootfs.display());
    println!("  squashfs:        {}", image.squashfs.display());
    Ok(())
}
