//! Build-time directives in the vendor's application templates.
//!
//! The vendor launcher fills `{{NAME}}` tokens each time an application
//! starts, so these templates stay templates: only marked blocks of fixed
//! directives are added, via [`crate::template`].

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::chroot::ChrootSession;
use crate::config::BuildConfig;
use crate::pipeline::{BuildContext, Stage, StageStatus};
use crate::template::{patch_file, Anchor, PatchOutcome, PatchSpec, PlaceholderSyntax};

/// Vendor template directory inside the rootfs.
pub const TEMPLATE_DIR: &str = "opt/emcomm-tools/conf/template.d";

/// One template and the directives it receives.
pub struct TemplateTarget {
    /// Path relative to [`TEMPLATE_DIR`].
    pub path: &'static str,
    pub comment: &'static str,
    pub anchor: Anchor,
    pub directives: Vec<String>,
}

/// Templates patched for this configuration. Targets with nothing to add
/// are omitted.
pub fn targets(config: &BuildConfig) -> Vec<TemplateTarget> {
    let op = &config.operator;
    let mut out = vec![
        TemplateTarget {
            path: "packet/direwolf.simple.conf",
            comment: "#",
            anchor: Anchor::After("ADEVICE".into()),
            directives: vec!["AGWPORT 8000".into(), "KISSPORT 8001".into()],
        },
        TemplateTarget {
            path: "packet/direwolf.aprs-digipeater.conf",
            comment: "#",
            anchor: Anchor::After("ADEVICE".into()),
            directives: vec!["AGWPORT 8000".into(), "KISSPORT 8001".into()],
        },
        TemplateTarget {
            path: "gps/gpsd.conf",
            comment: "#",
            anchor: Anchor::End,
            directives: vec!["START_DAEMON=\"true\"".into(), "GPSD_OPTIONS=\"-n\"".into()],
        },
    ];

    let mut station = Vec::new();
    if let Some(grid) = &op.grid_square {
        station.push(format!("DEFAULT_GRID={}", grid));
    }
    station.push(format!("DEFAULT_TIMEZONE={}", op.timezone));
    out.push(TemplateTarget {
        path: "user/station.conf",
        comment: "#",
        anchor: Anchor::End,
        directives: station,
    });
    out
}

pub struct AppTemplates;

impl Stage for AppTemplates {
    fn name(&self) -> &'static str {
        "app-templates"
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let dir = ctx.rootfs().join(TEMPLATE_DIR);
        let mut found = 0;
        let mut failed = Vec::new();
        for target in targets(ctx.config) {
            let path = dir.join(target.path);
            let spec = PatchSpec::new(target.comment, target.anchor, target.directives);
            match patch_file(&path, &spec, PlaceholderSyntax::default()) {
                Ok(PatchOutcome::Missing) => {
                    warn!(template = target.path, "vendor template not found, skipping");
                }
                Ok(PatchOutcome::Unchanged) => found += 1,
                Ok(PatchOutcome::Updated) => {
                    info!(template = target.path, "template patched");
                    found += 1;
                }
                Err(e) => {
                    warn!(template = target.path, error = %format!("{:#}", e), "template not patched");
                    failed.push(target.path);
                }
            }
        }
        if !failed.is_empty() {
            bail!("templates left unpatched: {}", failed.join(", "));
        }
        if found == 0 {
            return Ok(StageStatus::Skipped("no vendor templates found".into()));
        }
        Ok(StageStatus::Applied)
    }
}
