//! Partition strategy resolution for the unattended installer.
//!
//! The observed target-disk layout is classified by exactly one function,
//! [`classify`], and [`resolve`] turns that class (or an explicit override)
//! into a [`PartitionPlan`]. Erasing the whole disk is never chosen without
//! the operator's explicit confirmation: resolution fails instead.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config::PartitionInputs;
use crate::process::Cmd;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Smallest gap worth installing into alongside another OS.
pub const MIN_FREE_SPACE_GIB: u64 = 25;

/// Swap bounds in GiB.
pub const SWAP_MIN_GIB: u64 = 2;
pub const SWAP_MAX_GIB: u64 = 4;

/// More partitions than this is treated as an ambiguous table.
const MAX_SIMPLE_PARTITIONS: usize = 4;

/// EFI system partitions are small vfat volumes that every OS shares.
const ESP_MAX_BYTES: u64 = 2 * GIB;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error(
        "erasing {device} requires explicit confirmation \
         (pass --dangerously-erase-target-disk or set EMCOMM_CONFIRM_ERASE=1)"
    )]
    DestructiveUnconfirmed { device: String },

    #[error("{device} has {free_gib} GiB free, at least {needed_gib} GiB is needed")]
    InsufficientFreeSpace {
        device: String,
        free_gib: u64,
        needed_gib: u64,
    },

    #[error("unknown partition strategy '{0}' (expected reuse-partition, entire-disk or free-space)")]
    UnknownStrategy(String),
}

/// How the installer should treat the target disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    /// Format an existing Linux partition as the new root; nothing else touched.
    ReusePartition,
    /// Wipe the disk and lay out a fresh table. Destructive.
    EntireDisk,
    /// Install into unallocated space next to another OS.
    FreeSpace,
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStrategy::ReusePartition => write!(f, "reuse-partition"),
            PartitionStrategy::EntireDisk => write!(f, "entire-disk"),
            PartitionStrategy::FreeSpace => write!(f, "free-space"),
        }
    }
}

impl FromStr for PartitionStrategy {
    type Err = PartitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reuse" | "reuse-partition" => Ok(PartitionStrategy::ReusePartition),
            "entire-disk" | "erase" => Ok(PartitionStrategy::EntireDisk),
            "free-space" | "alongside" => Ok(PartitionStrategy::FreeSpace),
            other => Err(PartitionError::UnknownStrategy(other.to_string())),
        }
    }
}

/// What a partition's filesystem says about its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    /// ext4/btrfs/xfs: a candidate root for reuse.
    Linux,
    /// Linux swap.
    Swap,
    /// Shared EFI system partition.
    EfiSystem,
    /// NTFS, exFAT, APFS, HFS+, large FAT volumes.
    Foreign,
    /// LVM, RAID, LUKS, extended containers: never auto-handled.
    Container,
    /// No recognisable filesystem.
    Unknown,
}

/// One partition as observed on the target disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedPartition {
    pub path: String,
    pub size_bytes: u64,
    pub fstype: Option<String>,
    pub parttype: Option<String>,
}

impl ObservedPartition {
    pub fn role(&self) -> PartitionRole {
        if let Some(pt) = self.parttype.as_deref() {
            // MBR extended containers
            if matches!(pt, "0x5" | "0xf" | "0x85") {
                return PartitionRole::Container;
            }
        }
        match self.fstype.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("ext4" | "ext3" | "ext2" | "btrfs" | "xfs") => PartitionRole::Linux,
            Some("swap") => PartitionRole::Swap,
            Some("vfat") if self.size_bytes <= ESP_MAX_BYTES => PartitionRole::EfiSystem,
            Some("vfat" | "ntfs" | "exfat" | "apfs" | "hfsplus" | "bitlocker") => {
                PartitionRole::Foreign
            }
            Some("lvm2_member" | "linux_raid_member" | "crypto_luks" | "zfs_member") => {
                PartitionRole::Container
            }
            _ => PartitionRole::Unknown,
        }
    }
}

/// The target disk as observed at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub device: String,
    pub size_bytes: u64,
    /// Partition table type (`gpt`, `dos`), `None` if the disk is blank.
    pub table: Option<String>,
    pub partitions: Vec<ObservedPartition>,
}

impl DiskLayout {
    /// Unallocated bytes (approximation: disk size minus partition sizes).
    pub fn free_bytes(&self) -> u64 {
        let used: u64 = self.partitions.iter().map(|p| p.size_bytes).sum();
        self.size_bytes.saturating_sub(used)
    }

    fn largest_linux_partition(&self) -> Option<&ObservedPartition> {
        self.partitions
            .iter()
            .filter(|p| p.role() == PartitionRole::Linux)
            .max_by_key(|p| p.size_bytes)
    }
}

/// Classification of an observed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutClass {
    /// No partitions at all.
    Empty,
    /// Another OS is present and there is room next to it.
    ForeignWithFreeSpace,
    /// Only Linux-compatible partitions in a simple table.
    Compatible,
    /// Anything else.
    Complex,
}

impl LayoutClass {
    /// Strategy that auto-detection picks for this class.
    pub fn default_strategy(self) -> PartitionStrategy {
        match self {
            LayoutClass::Empty => PartitionStrategy::EntireDisk,
            LayoutClass::ForeignWithFreeSpace => PartitionStrategy::FreeSpace,
            LayoutClass::Compatible | LayoutClass::Complex => PartitionStrategy::ReusePartition,
        }
    }
}

/// Classify a disk layout.
pub fn classify(layout: &DiskLayout) -> LayoutClass {
    if layout.partitions.is_empty() {
        return LayoutClass::Empty;
    }

    let table_known = matches!(layout.table.as_deref(), Some("gpt" | "dos"));
    let roles: Vec<PartitionRole> = layout.partitions.iter().map(|p| p.role()).collect();

    if !table_known
        || layout.partitions.len() > MAX_SIMPLE_PARTITIONS
        || roles.contains(&PartitionRole::Container)
    {
        return LayoutClass::Complex;
    }

    let has_linux = roles.contains(&PartitionRole::Linux);
    let has_foreign = roles.contains(&PartitionRole::Foreign);
    let enough_free = layout.free_bytes() >= MIN_FREE_SPACE_GIB * GIB;

    match (has_linux, has_foreign) {
        (false, true) if enough_free => LayoutClass::ForeignWithFreeSpace,
        (true, false) => LayoutClass::Compatible,
        _ => LayoutClass::Complex,
    }
}

/// Swap size for the new installation: 25% of available space clamped to
/// [`SWAP_MIN_GIB`, `SWAP_MAX_GIB`]. An explicit override always wins.
pub fn swap_size_gib(available_gib: u64, override_gib: Option<u64>) -> u64 {
    match override_gib {
        Some(explicit) => explicit,
        None => (available_gib / 4).clamp(SWAP_MIN_GIB, SWAP_MAX_GIB),
    }
}

/// Fail closed when a destructive strategy lacks confirmation.
pub fn require_confirmation(
    strategy: PartitionStrategy,
    inputs: &PartitionInputs,
    device: &str,
) -> Result<(), PartitionError> {
    if strategy == PartitionStrategy::EntireDisk && !inputs.confirm_erase {
        return Err(PartitionError::DestructiveUnconfirmed {
            device: device.to_string(),
        });
    }
    Ok(())
}

/// Resolved partitioning decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub strategy: PartitionStrategy,
    pub device: String,
    /// Partition reused as root (reuse-partition only). `None` leaves the
    /// choice to the operator at install time.
    pub target_partition: Option<String>,
    pub swap_gib: u64,
    pub root_gib: u64,
}

/// Decide how to partition `layout`.
pub fn resolve(
    layout: &DiskLayout,
    inputs: &PartitionInputs,
) -> Result<PartitionPlan, PartitionError> {
    let class = classify(layout);
    let strategy = inputs
        .strategy_override
        .unwrap_or_else(|| class.default_strategy());

    require_confirmation(strategy, inputs, &layout.device)?;

    let (available_bytes, target_partition) = match strategy {
        PartitionStrategy::EntireDisk => (layout.size_bytes, None),
        PartitionStrategy::FreeSpace => {
            let free = layout.free_bytes();
            if free < MIN_FREE_SPACE_GIB * GIB {
                return Err(PartitionError::InsufficientFreeSpace {
                    device: layout.device.clone(),
                    free_gib: free / GIB,
                    needed_gib: MIN_FREE_SPACE_GIB,
                });
            }
            (free, None)
        }
        PartitionStrategy::ReusePartition => match layout.largest_linux_partition() {
            Some(p) => (p.size_bytes, Some(p.path.clone())),
            None => (0, None),
        },
    };

    let available_gib = available_bytes / GIB;
    let swap_gib = swap_size_gib(available_gib, inputs.swap_gib_override);
    Ok(PartitionPlan {
        strategy,
        device: layout.device.clone(),
        target_partition,
        swap_gib,
        root_gib: available_gib.saturating_sub(swap_gib),
    })
}

// =============================================================================
// Probing
// =============================================================================

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    path: String,
    #[serde(deserialize_with = "de_size")]
    size: u64,
    #[serde(rename = "type")]
    kind: String,
    fstype: Option<String>,
    parttype: Option<String>,
    pttype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// lsblk prints sizes as numbers in newer releases and strings in older ones.
fn de_size<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Num(u64),
        Str(String),
    }
    match Size::deserialize(d)? {
        Size::Num(n) => Ok(n),
        Size::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Parse `lsblk -J -b` output for a single disk.
pub fn parse_lsblk(json: &str) -> Result<DiskLayout> {
    let out: LsblkOutput = serde_json::from_str(json).context("Failed to parse lsblk JSON")?;
    let disk = out
        .blockdevices
        .into_iter()
        .find(|d| d.kind == "disk")
        .context("lsblk reported no disk device")?;

    let partitions = disk
        .children
        .iter()
        .filter(|c| c.kind == "part")
        .map(|c| ObservedPartition {
            path: c.path.clone(),
            size_bytes: c.size,
            fstype: c.fstype.clone(),
            parttype: c.parttype.clone(),
        })
        .collect();

    Ok(DiskLayout {
        device: disk.path,
        size_bytes: disk.size,
        table: disk.pttype,
        partitions,
    })
}

/// Observe the layout of `device` on the build host.
pub fn probe_disk(device: &str) -> Result<DiskLayout> {
    let result = Cmd::new("lsblk")
        .args(["-J", "-b", "-o", "NAME,PATH,SIZE,TYPE,FSTYPE,PARTTYPE,PTTYPE"])
        .arg(device)
        .error_msg(format!("lsblk could not inspect {}", device))
        .run()?;
    parse_lsblk(&result.stdout)
}
