//! Hostname and loopback host entry.

use anyhow::Result;

use crate::chroot::ChrootSession;
use crate::common::{ensure_line, write_if_changed};
use crate::pipeline::{BuildContext, Stage, StageStatus};

pub struct Identity;

impl Stage for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let hostname = &ctx.config.operator.hostname;
        let etc = ctx.rootfs().join("etc");

        write_if_changed(&etc.join("hostname"), format!("{}\n", hostname).as_bytes(), Some(0o644))?;
        ensure_line(&etc.join("hosts"), &format!("127.0.1.1\t{}", hostname), |l| {
            l.trim_start().starts_with("127.0.1.1")
        })?;
        Ok(StageStatus::Applied)
    }
}
