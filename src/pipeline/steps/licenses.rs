//! Pre-registered license keys for commercial modem software.

use anyhow::Result;
use tracing::warn;

use crate::chroot::ChrootSession;
use crate::pipeline::{BuildContext, Stage, StageStatus};
use crate::template::{patch_file, Anchor, PatchOutcome, PatchSpec, PlaceholderSyntax};

/// License template shipped by the vendor payload.
pub const LICENSE_TEMPLATE: &str = "opt/emcomm-tools/conf/template.d/licenses.conf";

/// `<PRODUCT>_KEY=<key>` for each configured product, in product order.
pub fn directives<'a>(keys: impl IntoIterator<Item = (&'a String, &'a String)>) -> Vec<String> {
    keys.into_iter()
        .map(|(product, key)| format!("{}_KEY={}", product.to_ascii_uppercase(), key))
        .collect()
}

pub struct Licenses;

impl Stage for Licenses {
    fn name(&self) -> &'static str {
        "licenses"
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let keys = &ctx.config.operator.license_keys;
        if keys.is_empty() {
            return Ok(StageStatus::Skipped("no license keys configured".into()));
        }

        let spec = PatchSpec::new("#", Anchor::End, directives(keys));
        let path = ctx.rootfs().join(LICENSE_TEMPLATE);
        if patch_file(&path, &spec, PlaceholderSyntax::default())? == PatchOutcome::Missing {
            warn!(template = LICENSE_TEMPLATE, "license template not found, keys not applied");
            return Ok(StageStatus::Skipped("license template not found".into()));
        }
        Ok(StageStatus::Applied)
    }
}
