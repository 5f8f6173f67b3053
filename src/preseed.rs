//! Unattended-install descriptor and boot entry patching.
//!
//! The descriptor is a subiquity `autoinstall.yaml` at the root of the image,
//! where the installer reads it from the install medium before the target
//! root exists. Boot entries in both GRUB configs get the `autoinstall` flag
//! so the installer skips its confirmation prompt.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::BuildConfig;
use crate::partition::{PartitionPlan, PartitionStrategy, GIB};
use crate::process::Cmd;

pub const DESCRIPTOR_NAME: &str = "autoinstall.yaml";

/// Kernel arguments added to every installer boot entry.
pub const AUTOINSTALL_FLAGS: &[&str] = &[
    "autoinstall",
    "subiquity.autoinstallpath=/cdrom/autoinstall.yaml",
];

/// Boot configs patched identically.
pub const BOOT_CONFIGS: &[&str] = &["boot/grub/grub.cfg", "boot/grub/loopback.cfg"];

#[derive(Debug, Serialize)]
pub struct Descriptor {
    pub autoinstall: Autoinstall,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Autoinstall {
    pub version: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub interactive_sections: Vec<String>,
    pub locale: String,
    pub keyboard: Keyboard,
    pub timezone: String,
    pub identity: Identity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,
}

#[derive(Debug, Serialize)]
pub struct Keyboard {
    pub layout: String,
}

#[derive(Debug, Serialize)]
pub struct Identity {
    pub hostname: String,
    pub username: String,
    pub realname: String,
    /// SHA-512 crypt hash.
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct Storage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<Layout>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<StorageAction>,
    pub swap: Swap,
}

#[derive(Debug, Serialize)]
pub struct Layout {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_disk: Option<DiskMatch>,
}

#[derive(Debug, Serialize)]
pub struct DiskMatch {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct Swap {
    /// Bytes.
    pub size: u64,
}

/// One curtin storage action.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageAction {
    Disk {
        id: String,
        path: String,
        preserve: bool,
    },
    Partition {
        id: String,
        device: String,
        number: u32,
        preserve: bool,
    },
    Format {
        id: String,
        volume: String,
        fstype: String,
    },
    Mount {
        id: String,
        device: String,
        path: String,
    },
}

/// Storage section for a resolved plan. `None` when the plan reuses a
/// partition but the disk offered none to reuse; the operator then picks
/// the layout at install time.
pub fn storage_for(plan: &PartitionPlan) -> Result<Option<Storage>> {
    let swap = Swap {
        size: plan.swap_gib * GIB,
    };
    let disk_match = || {
        Some(DiskMatch {
            path: plan.device.clone(),
        })
    };
    let storage = match plan.strategy {
        PartitionStrategy::EntireDisk => Storage {
            layout: Some(Layout {
                name: "direct".into(),
                mode: None,
                match_disk: disk_match(),
            }),
            config: Vec::new(),
            swap,
        },
        PartitionStrategy::FreeSpace => Storage {
            layout: Some(Layout {
                name: "direct".into(),
                mode: Some("use_gap".into()),
                match_disk: disk_match(),
            }),
            config: Vec::new(),
            swap,
        },
        PartitionStrategy::ReusePartition => {
            let Some(target) = plan.target_partition.as_deref() else {
                warn!(
                    device = %plan.device,
                    "no Linux partition to reuse; storage will be chosen at install time"
                );
                return Ok(None);
            };
            let number = partition_number(target)
                .with_context(|| format!("Cannot determine partition number of {}", target))?;
            Storage {
                layout: None,
                config: vec![
                    StorageAction::Disk {
                        id: "disk-target".into(),
                        path: plan.device.clone(),
                        preserve: true,
                    },
                    StorageAction::Partition {
                        id: "part-root".into(),
                        device: "disk-target".into(),
                        number,
                        preserve: true,
                    },
                    StorageAction::Format {
                        id: "format-root".into(),
                        volume: "part-root".into(),
                        fstype: "ext4".into(),
                    },
                    StorageAction::Mount {
                        id: "mount-root".into(),
                        device: "format-root".into(),
                        path: "/".into(),
                    },
                ],
                swap,
            }
        }
    };
    Ok(Some(storage))
}

/// Trailing partition number of a device path (`/dev/sda3`, `/dev/nvme0n1p2`).
pub fn partition_number(path: &str) -> Option<u32> {
    let digits: String = path
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

/// Hash a password with SHA-512 crypt. The plaintext goes to openssl on
/// stdin and is never written to disk or argv.
pub fn hash_password(plain: &str) -> Result<String> {
    let result = Cmd::new("openssl")
        .args(["passwd", "-6", "-stdin"])
        .stdin_bytes(format!("{}\n", plain))
        .error_msg("openssl could not hash the operator password")
        .run()?;
    let hash = result.stdout_trimmed().to_string();
    if !hash.starts_with("$6$") {
        bail!("openssl returned an unexpected password hash format");
    }
    Ok(hash)
}

impl Descriptor {
    /// Assemble the descriptor. Without a plan, or with a plan that has no
    /// partition to reuse, the storage section is left to the operator at
    /// install time.
    pub fn build(config: &BuildConfig, plan: Option<&PartitionPlan>, password_hash: String) -> Result<Self> {
        let op = &config.operator;
        let username = op
            .username
            .clone()
            .context("unattended install needs EMCOMM_USERNAME")?;

        let storage = match plan {
            Some(plan) => storage_for(plan)?,
            None => None,
        };
        let interactive_sections = if storage.is_some() {
            Vec::new()
        } else {
            vec!["storage".to_string()]
        };

        Ok(Self {
            autoinstall: Autoinstall {
                version: 1,
                interactive_sections,
                locale: op.locale.clone(),
                keyboard: Keyboard {
                    layout: op.keyboard_layout.clone(),
                },
                timezone: op.timezone.clone(),
                identity: Identity {
                    hostname: op.hostname.clone(),
                    realname: op.fullname.clone().unwrap_or_else(|| username.clone()),
                    username,
                    password: password_hash,
                },
                storage,
            },
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        let body = serde_yaml::to_string(self).context("Failed to serialize autoinstall descriptor")?;
        Ok(format!("#cloud-config\n{}", body))
    }

    /// Write `autoinstall.yaml` at the root of `iso_tree`.
    pub fn write(&self, iso_tree: &Path) -> Result<PathBuf> {
        let path = iso_tree.join(DESCRIPTOR_NAME);
        let tmp = iso_tree.join(format!(".{}.tmp", DESCRIPTOR_NAME));
        fs::write(&tmp, self.to_yaml()?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move {} into place", path.display()))?;
        info!(path = %path.display(), "wrote autoinstall descriptor");
        Ok(path)
    }
}

/// Add [`AUTOINSTALL_FLAGS`] to every `linux` line of a GRUB config, before
/// the `---` separator. Flags already present are not repeated. Returns the
/// new text and the number of lines changed.
pub fn patch_boot_entries(text: &str) -> (String, usize) {
    let mut changed = 0;
    let mut out = String::with_capacity(text.len() + 128);

    for line in text.split_inclusive('\n') {
        let (body, eol) = match line.strip_suffix('\n') {
            Some(b) => (b, "\n"),
            None => (line, ""),
        };
        let trimmed = body.trim_start();
        let is_kernel_line = trimmed.starts_with("linux ") || trimmed.starts_with("linux\t");
        if !is_kernel_line {
            out.push_str(line);
            continue;
        }

        let tokens: Vec<&str> = body.split_whitespace().collect();
        let missing: Vec<&str> = AUTOINSTALL_FLAGS
            .iter()
            .copied()
            .filter(|flag| !tokens.contains(flag))
            .collect();
        if missing.is_empty() {
            out.push_str(line);
            continue;
        }

        let insert = missing.join(" ");
        let patched = match body.find(" ---") {
            Some(pos) => format!("{} {}{}", &body[..pos], insert, &body[pos..]),
            None => format!("{} {}", body.trim_end(), insert),
        };
        out.push_str(&patched);
        out.push_str(eol);
        changed += 1;
    }

    (out, changed)
}

/// True when every kernel line of `text` carries the autoinstall flags.
pub fn has_autoinstall_flags(text: &str) -> bool {
    let mut kernel_lines = text
        .lines()
        .filter(|l| l.trim_start().starts_with("linux"))
        .peekable();
    kernel_lines.peek().is_some()
        && kernel_lines.all(|l| {
            let tokens: Vec<&str> = l.split_whitespace().collect();
            AUTOINSTALL_FLAGS.iter().all(|f| tokens.contains(f))
        })
}

/// Patch both boot configs under `iso_tree`. grub.cfg must exist;
/// loopback.cfg is optional.
pub fn patch_boot_configs(iso_tree: &Path) -> Result<usize> {
    let mut total = 0;
    for (i, rel) in BOOT_CONFIGS.iter().enumerate() {
        let path = iso_tree.join(rel);
        if !path.is_file() {
            if i == 0 {
                bail!("Boot config {} not found", path.display());
            }
            warn!(path = %path.display(), "boot config missing, skipped");
            continue;
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let (patched, changed) = patch_boot_entries(&text);
        if changed > 0 {
            fs::write(&path, patched)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        info!(path = %path.display(), entries = changed, "patched boot entries");
        total += changed;
    }
    Ok(total)
}
