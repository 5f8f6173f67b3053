//! Build command - produces a customized installer image.
//!
//! Order matters: the release is resolved before anything on disk changes, so
//! a bad tag leaves the cache and working directory untouched. Everything
//! after that runs under the working-directory lock.

use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use crate::config::BuildConfig;
use crate::error::{BuildError, ErrorClass};
use crate::extract::extract_image;
use crate::lock::WorkLock;
use crate::pipeline::{BuildContext, Pipeline, PipelineReport};
use crate::preflight;
use crate::release::{ReleaseSource, ResolvedRelease};
use crate::timing::Timer;
use crate::verify::{self, VerificationReport};

use super::download::{base_image_filename, fetch_artifacts, resolve_release};

/// What a build run produced.
#[derive(Debug)]
pub struct BuildOutcome {
    pub release: ResolvedRelease,
    /// `None` for a dry run.
    pub image: Option<PathBuf>,
    pub stages: Option<PipelineReport>,
    pub verification: Option<VerificationReport>,
}

/// Run a build with `pipeline` against release metadata from `source`.
///
/// `check_host` is off for dry runs and for callers that have already
/// checked the host.
pub fn run_build(
    config: &BuildConfig,
    source: &dyn ReleaseSource,
    pipeline: &Pipeline,
    check_host: bool,
) -> Result<BuildOutcome> {
    let timer = Timer::start("build");

    let release = resolve_release(config, source)?;
    println!("Release: {}", release.describe());

    if config.dry_run {
        print_plan(config, &release, pipeline)?;
        return Ok(BuildOutcome {
            release,
            image: None,
            stages: None,
            verification: None,
        });
    }

    if check_host {
        preflight::ensure_ready(config)?;
    }

    let _lock = WorkLock::try_acquire(&config.work_dir)?;
    let artifacts = fetch_artifacts(config, &release)?;
    if crate::interrupt::is_interrupted() {
        return Err(BuildError::Interrupted.into());
    }

    let image = extract_image(&artifacts.base_image, &config.iso_tree(), &config.rootfs())
        .map_err(|e| ErrorClass::Extraction.wrap(&e))?;

    let ctx = BuildContext {
        config,
        release: &release,
        image: &image,
        base_image: &artifacts.base_image,
        payload: &artifacts.payload,
    };
    let stages = pipeline.run(&ctx)?;
    stages.print();

    let verification = verify::verify(&ctx);
    verification.print();
    verification.enforce(config.strict_verify)?;

    let output = ctx.output_image();
    timer.finish();
    info!(image = %output.display(), "build complete");
    Ok(BuildOutcome {
        release,
        image: Some(output),
        stages: Some(stages),
        verification: Some(verification),
    })
}

/// Describe what a real run would do, without touching the disk.
fn print_plan(config: &BuildConfig, release: &ResolvedRelease, pipeline: &Pipeline) -> Result<()> {
    println!("\n=== Dry run: nothing will be downloaded or modified ===\n");
    println!("Inputs:");
    println!(
        "  base image:     {}",
        config.cache_dir.join(base_image_filename(config)?).display()
    );
    println!("    from {}", config.base_image_url);
    println!(
        "  vendor payload: {}",
        config.cache_dir.join(release.payload_filename()).display()
    );
    println!("    from {}", release.payload_url);
    println!("Output:");
    println!("  {}", config.output_dir.join(release.image_filename()).display());
    println!("  volume label {}", release.volume_label());
    println!("Stages:");
    for stage in pipeline.stages() {
        let state = if stage.enabled(config) { "run" } else { "skip" };
        let chroot = if stage.requires_chroot() { " (chroot)" } else { "" };
        println!("  [{:4}] {}{}", state, stage.name(), chroot);
    }
    if config.autoinstall {
        match (&config.partition.target_disk, config.partition.strategy_override) {
            (Some(disk), Some(s)) => println!("Partitioning: {} on {}", s, disk),
            (Some(disk), None) => println!("Partitioning: detected from {} at build time", disk),
            (None, _) => println!("Partitioning: chosen by the operator at install time"),
        }
    }
    Ok(())
}

/// Execute the build command against the configured GitHub repository.
pub fn cmd_build(config: &BuildConfig, source: &dyn ReleaseSource) -> Result<()> {
    let pipeline = Pipeline::new(crate::pipeline::steps::standard_stages());
    let outcome = run_build(config, source, &pipeline, !config.dry_run)?;
    if let Some(image) = outcome.image {
        println!("\nImage: {}", image.display());
        println!("       {}", crate::artifact::iso::checksum_path(&image).display());
    }
    Ok(())
}
