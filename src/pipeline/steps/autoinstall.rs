//! Unattended-install descriptor and boot entries.

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::chroot::ChrootSession;
use crate::config::BuildConfig;
use crate::error::ErrorClass;
use crate::partition::{self, DiskLayout, PartitionPlan};
use crate::pipeline::{BuildContext, Stage, StageStatus};
use crate::preseed::{self, Descriptor};

/// Resolve the partition plan for this build. `probe` observes a disk.
///
/// Without a target disk the storage section is left interactive; a strategy
/// override without a disk to check it against is refused.
pub fn plan_for(
    config: &BuildConfig,
    probe: impl Fn(&str) -> Result<DiskLayout>,
) -> Result<Option<PartitionPlan>> {
    let inputs = &config.partition;
    let Some(device) = inputs.target_disk.as_deref() else {
        if let Some(strategy) = inputs.strategy_override {
            bail!(
                "partition strategy '{}' was requested but no target disk is set (EMCOMM_TARGET_DISK)",
                strategy
            );
        }
        return Ok(None);
    };

    let layout = probe(device)?;
    let plan = partition::resolve(&layout, inputs)?;
    info!(
        device = %plan.device,
        strategy = %plan.strategy,
        swap_gib = plan.swap_gib,
        root_gib = plan.root_gib,
        "partition plan resolved"
    );
    Ok(Some(plan))
}

pub struct Autoinstall;

impl Autoinstall {
    fn apply_with(
        &self,
        ctx: &BuildContext<'_>,
        probe: impl Fn(&str) -> Result<DiskLayout>,
        hash: impl Fn(&str) -> Result<String>,
    ) -> Result<StageStatus> {
        let op = &ctx.config.operator;
        if op.username.is_none() {
            bail!("unattended install needs EMCOMM_USERNAME");
        }
        let password = op
            .password
            .as_deref()
            .context("unattended install needs EMCOMM_PASSWORD")?;

        let plan = plan_for(ctx.config, probe)?;
        let descriptor = Descriptor::build(ctx.config, plan.as_ref(), hash(password)?)?;
        descriptor.write(ctx.iso_tree())?;
        preseed::patch_boot_configs(ctx.iso_tree())?;
        Ok(StageStatus::Applied)
    }
}

impl Stage for Autoinstall {
    fn name(&self) -> &'static str {
        "autoinstall"
    }

    fn failure_class(&self) -> Option<ErrorClass> {
        Some(ErrorClass::PartitionStrategy)
    }

    fn enabled(&self, config: &BuildConfig) -> bool {
        config.autoinstall
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        self.apply_with(ctx, partition::probe_disk, preseed::hash_password)
    }
}
