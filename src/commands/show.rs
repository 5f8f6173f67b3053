//! Show command - displays information.

use anyhow::Result;

use crate::cache::{sha256_file, ArtifactCache};
use crate::config::BuildConfig;
use crate::release::ReleaseSource;

use super::download::resolve_release;

/// Show target for the show command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowTarget {
    /// Show configuration
    Config,
    /// Resolve and show the release a build would use
    Release,
    /// List cached artifacts with their SHA-256
    Cache,
}

/// Execute the show command.
pub fn cmd_show(config: &BuildConfig, target: ShowTarget, source: &dyn ReleaseSource) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Release => {
            let release = resolve_release(config, source)?;
            println!("Release ({}):", config.release_mode);
            println!("  tag:        {}", release.tag);
            println!("  name:       {}", release.name);
            println!(
                "  published:  {}",
                release.published_at.as_deref().unwrap_or("(unpublished tag)")
            );
            println!("  payload:    {}", release.payload_url);
            println!("  image:      {}", release.image_filename());
            println!("  label:      {}", release.volume_label());
        }
        ShowTarget::Cache => {
            let cache = ArtifactCache::new(&config.cache_dir);
            let files = cache.list()?;
            if files.is_empty() {
                println!("Cache {} is empty.", cache.dir().display());
                return Ok(());
            }
            println!("Cache {}:", cache.dir().display());
            for path in files {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                println!("  {}  {:>8} MB  {}", sha256_file(&path)?, size / 1024 / 1024, name);
            }
        }
    }
    Ok(())
}
