//! Desktop defaults as a system dconf database.

use anyhow::Result;
use tracing::warn;

use crate::chroot::ChrootSession;
use crate::common::write_if_changed;
use crate::config::BuildConfig;
use crate::pipeline::{BuildContext, Stage, StageStatus};
use crate::process::{self, Cmd};

pub const DCONF_PROFILE: &str = "etc/dconf/profile/user";
pub const DCONF_KEYFILE: &str = "etc/dconf/db/local.d/00-emcomm-iso";

pub struct Desktop;

pub fn keyfile(config: &BuildConfig) -> String {
    let op = &config.operator;
    let scheme = if op.dark_mode { "prefer-dark" } else { "default" };
    let mut out = format!("[org/gnome/desktop/interface]\ncolor-scheme='{}'\n", scheme);
    if let Some(scale) = &op.text_scale {
        out.push_str(&format!("text-scaling-factor={}\n", scale));
    }
    out.push_str("\n[org/gnome/desktop/screensaver]\nlock-enabled=false\n");
    out.push_str("\n[org/gnome/desktop/session]\nidle-delay=uint32 0\n");
    out
}

impl Stage for Desktop {
    fn name(&self) -> &'static str {
        "desktop"
    }

    fn enabled(&self, config: &BuildConfig) -> bool {
        !config.minimal
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        if let Some(scale) = &ctx.config.operator.text_scale {
            scale
                .parse::<f64>()
                .map_err(|_| anyhow::anyhow!("EMCOMM_TEXT_SCALE is not a number: {}", scale))?;
        }

        let rootfs = ctx.rootfs();
        write_if_changed(&rootfs.join(DCONF_PROFILE), b"user-db:user\nsystem-db:local\n", Some(0o644))?;
        let changed = write_if_changed(&rootfs.join(DCONF_KEYFILE), keyfile(ctx.config).as_bytes(), Some(0o644))?;

        let db = rootfs.join("etc/dconf/db/local");
        if changed || !db.exists() {
            if process::exists("dconf") {
                Cmd::new("dconf")
                    .arg("compile")
                    .arg_path(&db)
                    .arg_path(&rootfs.join("etc/dconf/db/local.d"))
                    .error_msg("dconf compile failed")
                    .run()?;
            } else {
                warn!("dconf not found on host; defaults apply after the first `dconf update` on the target");
            }
        }
        Ok(StageStatus::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::steps::testutil::Scratch;
    use std::fs;

    #[test]
    fn test_keyfile_contents() {
        let s = Scratch::new(&[("EMCOMM_DARK_MODE", "1"), ("EMCOMM_TEXT_SCALE", "1.25")]);
        let k = keyfile(&s.config);
        assert!(k.contains("color-scheme='prefer-dark'"));
        assert!(k.contains("text-scaling-factor=1.25"));
    }

    #[test]
    fn test_disabled_for_minimal() {
        let s = Scratch::new(&[("EMCOMM_MINIMAL", "1")]);
        assert!(!Desktop.enabled(&s.config));
    }

    #[test]
    fn test_bad_scale_rejected() {
        let s = Scratch::new(&[("EMCOMM_TEXT_SCALE", "huge")]);
        assert!(Desktop.apply(&s.ctx(), None).is_err());
    }

    #[test]
    fn test_keyfile_written_once() {
        let s = Scratch::new(&[]);
        let path = s.rootfs().join(DCONF_KEYFILE);
        write_if_changed(&path, keyfile(&s.config).as_bytes(), Some(0o644)).unwrap();
        assert!(!write_if_changed(&path, keyfile(&s.config).as_bytes(), Some(0o644)).unwrap());
        assert!(fs::read_to_string(path).unwrap().contains("lock-enabled=false"));
    }
}
