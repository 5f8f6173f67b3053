//! Download command - resolves the release and fills the artifact cache.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use crate::cache::{filename_from_url, ArtifactCache, ArtifactKind};
use crate::config::BuildConfig;
use crate::release::{self, ReleaseSource, ResolvedRelease};

/// Cached inputs of a build.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub base_image: PathBuf,
    pub payload: PathBuf,
}

/// Cache filename of the base image, taken from its URL.
pub fn base_image_filename(config: &BuildConfig) -> Result<String> {
    filename_from_url(&config.base_image_url)
        .with_context(|| format!("Cannot derive a filename from {}", config.base_image_url))
}

/// Resolve the configured release mode.
pub fn resolve_release(config: &BuildConfig, source: &dyn ReleaseSource) -> Result<ResolvedRelease> {
    info!(mode = %config.release_mode, repo = %config.vendor_repo, "resolving release");
    release::resolve(source, &config.release_mode)
}

/// Make sure both artifacts are cached, downloading what is missing.
pub fn fetch_artifacts(config: &BuildConfig, release: &ResolvedRelease) -> Result<Artifacts> {
    let cache = ArtifactCache::new(&config.cache_dir);
    let base_image = cache.ensure(
        ArtifactKind::BaseImage,
        &config.base_image_url,
        &base_image_filename(config)?,
    )?;
    let payload = cache.ensure(
        ArtifactKind::VendorPayload,
        &release.payload_url,
        &release.payload_filename(),
    )?;
    Ok(Artifacts { base_image, payload })
}

/// Execute the download command.
pub fn cmd_download(config: &BuildConfig, source: &dyn ReleaseSource) -> Result<()> {
    let release = resolve_release(config, source)?;
    println!("Release: {}", release.describe());

    let artifacts = fetch_artifacts(config, &release)?;
    println!("\nArtifacts:");
    println!("  base image:     {} [OK]", artifacts.base_image.display());
    println!("  vendor payload: {} [OK]", artifacts.payload.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliOverrides;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_prepopulated_cache_needs_no_network() {
        let dir = tempfile::tempdir().unwrap();
        let vars: HashMap<String, String> = [(
            "EMCOMM_BASE_IMAGE_URL".to_string(),
            "http://127.0.0.1:9/ubuntu-22.04.5-desktop-amd64.iso".to_string(),
        )]
        .into_iter()
        .collect();
        let config = BuildConfig::from_vars(dir.path(), &vars, &CliOverrides::default()).unwrap();
        let release = ResolvedRelease {
            tag: "R5".into(),
            name: "R5".into(),
            published_at: None,
            payload_url: "http://127.0.0.1:9/R5.tar.gz".into(),
        };
        fs::create_dir_all(&config.cache_dir).unwrap();
        fs::write(config.cache_dir.join("ubuntu-22.04.5-desktop-amd64.iso"), b"iso").unwrap();
        fs::write(config.cache_dir.join(release.payload_filename()), b"tgz").unwrap();

        let artifacts = fetch_artifacts(&config, &release).unwrap();
        assert_eq!(fs::read(artifacts.base_image).unwrap(), b"iso");
        assert_eq!(fs::read(artifacts.payload).unwrap(), b"tgz");
    }
}
