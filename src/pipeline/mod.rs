//! Customization pipeline.
//!
//! An ordered list of [`Stage`]s driven by one loop. Stages run strictly in
//! list order and never depend on a later stage. Contiguous stages that need
//! the chroot share one [`ChrootSession`], acquired right before the first of
//! them and released right after the last; a fatal failure releases it before
//! the error leaves [`Pipeline::run`].

pub mod steps;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::chroot::{ChrootSession, MountSet, Mounter, SystemMounter};
use crate::config::BuildConfig;
use crate::error::{BuildError, ErrorClass};
use crate::extract::ExtractedImage;
use crate::release::ResolvedRelease;
use crate::timing::{format_duration, Timer};

/// Everything a stage may read. Stages never mutate the configuration.
pub struct BuildContext<'a> {
    pub config: &'a BuildConfig,
    pub release: &'a ResolvedRelease,
    pub image: &'a ExtractedImage,
    /// Cached base installer image (boot records are replayed from it).
    pub base_image: &'a Path,
    /// Cached vendor payload tarball.
    pub payload: &'a Path,
}

impl BuildContext<'_> {
    pub fn rootfs(&self) -> &Path {
        &self.image.rootfs
    }

    pub fn iso_tree(&self) -> &Path {
        &self.image.iso_tree
    }

    /// Final image path under the output directory.
    pub fn output_image(&self) -> PathBuf {
        self.config.output_dir.join(self.release.image_filename())
    }
}

/// What a stage did when it returned `Ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Applied,
    /// Nothing to do (feature not configured, template absent, ...).
    Skipped(String),
}

/// One customization step.
pub trait Stage {
    fn name(&self) -> &'static str;

    /// `Some(class)` makes a failure abort the build as that class of
    /// error; `None` downgrades failures to warnings.
    fn failure_class(&self) -> Option<ErrorClass> {
        None
    }

    fn fatal(&self) -> bool {
        self.failure_class().is_some()
    }

    fn requires_chroot(&self) -> bool {
        false
    }

    /// Whether the stage runs at all for this configuration.
    fn enabled(&self, _config: &BuildConfig) -> bool {
        true
    }

    /// Apply the stage. Must be idempotent: applying twice leaves the tree
    /// as applying once. `chroot` is mounted when `requires_chroot()`.
    fn apply(&self, ctx: &BuildContext<'_>, chroot: Option<&mut ChrootSession>) -> Result<StageStatus>;
}

/// Recorded result of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Applied,
    Skipped(String),
    /// Best-effort failure, carried as a warning.
    Warned(String),
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub name: &'static str,
    pub outcome: StageOutcome,
    pub elapsed: Duration,
}

/// Per-stage results of a completed run.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub records: Vec<StageRecord>,
}

impl PipelineReport {
    pub fn warnings(&self) -> Vec<&StageRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, StageOutcome::Warned(_)))
            .collect()
    }

    pub fn outcome(&self, name: &str) -> Option<&StageOutcome> {
        self.records.iter().find(|r| r.name == name).map(|r| &r.outcome)
    }

    pub fn print(&self) {
        println!("\nStages:");
        for r in &self.records {
            let (tag, detail) = match &r.outcome {
                StageOutcome::Applied => ("OK", String::new()),
                StageOutcome::Skipped(why) => ("SKIP", format!(" ({})", why)),
                StageOutcome::Warned(why) => ("WARN", format!(" ({})", why)),
            };
            println!(
                "  [{:4}] {:<16} {:>7}{}",
                tag,
                r.name,
                format_duration(r.elapsed),
                detail
            );
        }
        let warned = self.warnings().len();
        if warned > 0 {
            println!("  {} stage(s) finished with warnings", warned);
        }
    }
}

type MounterFactory = Box<dyn Fn() -> Box<dyn Mounter>>;

/// The stage list plus what it needs to run.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    mounter: MounterFactory,
    interrupt: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self {
            stages,
            mounter: Box::new(|| Box::new(SystemMounter)),
            interrupt: crate::interrupt::flag(),
        }
    }

    /// Replace how chroot mounts are performed.
    pub fn with_mounter(mut self, factory: impl Fn() -> Box<dyn Mounter> + 'static) -> Self {
        self.mounter = Box::new(factory);
        self
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn stages(&self) -> &[Box<dyn Stage>] {
        &self.stages
    }

    /// Run every stage in order.
    pub fn run(&self, ctx: &BuildContext<'_>) -> Result<PipelineReport, BuildError> {
        let mut report = PipelineReport::default();
        let mut session: Option<ChrootSession> = None;

        for stage in &self.stages {
            if self.interrupt.load(Ordering::SeqCst) {
                release_after_failure(&mut session);
                warn!(next = stage.name(), "interrupted, stopping before next stage");
                return Err(BuildError::Interrupted);
            }

            if !stage.enabled(ctx.config) {
                info!(stage = stage.name(), "disabled for this build");
                report.records.push(StageRecord {
                    name: stage.name(),
                    outcome: StageOutcome::Skipped("disabled".into()),
                    elapsed: Duration::ZERO,
                });
                continue;
            }

            if stage.requires_chroot() {
                if session.is_none() {
                    let mut s = ChrootSession::new(MountSet::standard(ctx.rootfs()), (self.mounter)());
                    match s.acquire() {
                        Ok(()) => session = Some(s),
                        Err(e) if stage.fatal() => {
                            error!(stage = stage.name(), error = %format!("{:#}", e), "chroot unavailable");
                            return Err(ErrorClass::ChrootInstall.wrap(&e));
                        }
                        Err(e) => {
                            warn!(stage = stage.name(), error = %format!("{:#}", e), "chroot unavailable, skipping stage");
                            report.records.push(StageRecord {
                                name: stage.name(),
                                outcome: StageOutcome::Warned(format!("chroot unavailable: {:#}", e)),
                                elapsed: Duration::ZERO,
                            });
                            continue;
                        }
                    }
                }
            } else {
                release(&mut session)?;
            }

            info!(stage = stage.name(), "stage starting");
            let timer = Timer::start(stage.name());
            let result = stage.apply(ctx, session.as_mut());
            let elapsed = timer.finish();

            let outcome = match result {
                Ok(StageStatus::Applied) => StageOutcome::Applied,
                Ok(StageStatus::Skipped(why)) => {
                    info!(stage = stage.name(), reason = %why, "stage skipped");
                    StageOutcome::Skipped(why)
                }
                Err(e) => match stage.failure_class() {
                    Some(class) => {
                        release_after_failure(&mut session);
                        error!(stage = stage.name(), error = %format!("{:#}", e), "fatal stage failed");
                        return Err(class.wrap(&e));
                    }
                    None => {
                        warn!(stage = stage.name(), error = %format!("{:#}", e), "stage failed, continuing");
                        StageOutcome::Warned(format!("{:#}", e))
                    }
                },
            };
            report.records.push(StageRecord {
                name: stage.name(),
                outcome,
                elapsed,
            });
        }

        release(&mut session)?;
        Ok(report)
    }
}

/// Release the chroot. A mount point that stays mounted is fatal: no later
/// stage may pack or delete a root filesystem with host trees inside it.
fn release(session: &mut Option<ChrootSession>) -> Result<(), BuildError> {
    let Some(mut s) = session.take() else {
        return Ok(());
    };
    match s.release() {
        0 => Ok(()),
        leftover => Err(BuildError::ChrootInstall(format!(
            "{} mount point(s) under {} could not be unmounted; run `sudo umount -R {}` before building again",
            leftover,
            s.root().display(),
            s.root().display()
        ))),
    }
}

/// Release on a path that already carries an error; leftover mounts are
/// logged and the original error wins.
fn release_after_failure(session: &mut Option<ChrootSession>) {
    if let Err(e) = release(session) {
        error!(error = %e, "chroot not fully released");
    }
}
