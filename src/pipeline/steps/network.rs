//! Pre-provisioned WiFi networks as NetworkManager keyfiles.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::chroot::ChrootSession;
use crate::common::write_if_changed;
use crate::config::WifiNetwork;
use crate::pipeline::{BuildContext, Stage, StageStatus};

pub const CONNECTIONS_DIR: &str = "etc/NetworkManager/system-connections";

pub struct Network;

/// Stable connection UUID derived from the SSID, so rebuilding produces the
/// same keyfile.
fn connection_uuid(ssid: &str) -> String {
    let digest = Sha256::digest(format!("emcomm-iso wifi {}", ssid).as_bytes());
    let h: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-5{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[13..16],
        &h[16..20],
        &h[20..32]
    )
}

/// Filename for a network's keyfile.
pub fn keyfile_name(ssid: &str) -> String {
    let stem: String = ssid
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}.nmconnection", stem)
}

pub fn keyfile(net: &WifiNetwork) -> String {
    let mut out = format!(
        "[connection]\nid={ssid}\nuuid={uuid}\ntype=wifi\nautoconnect=true\n\n\
         [wifi]\nmode=infrastructure\nssid={ssid}\n\n",
        ssid = net.ssid,
        uuid = connection_uuid(&net.ssid)
    );
    if let Some(psk) = &net.psk {
        out.push_str(&format!("[wifi-security]\nkey-mgmt=wpa-psk\npsk={}\n\n", psk));
    }
    out.push_str("[ipv4]\nmethod=auto\n\n[ipv6]\naddr-gen-mode=default\nmethod=auto\n");
    out
}

impl Stage for Network {
    fn name(&self) -> &'static str {
        "network"
    }

    fn apply(&self, ctx: &BuildContext<'_>, _chroot: Option<&mut ChrootSession>) -> Result<StageStatus> {
        let networks = &ctx.config.operator.wifi;
        if networks.is_empty() {
            return Ok(StageStatus::Skipped("no WiFi networks configured".into()));
        }
        let dir = ctx.rootfs().join(CONNECTIONS_DIR);
        for net in networks {
            // NetworkManager ignores keyfiles readable by anyone but root.
            write_if_changed(&dir.join(keyfile_name(&net.ssid)), keyfile(net).as_bytes(), Some(0o600))?;
        }
        Ok(StageStatus::Applied)
    }
}
