//! Host tools and privileges.

use crate::config::BuildConfig;

use super::types::CheckResult;

/// Tools every build needs: (binary, Ubuntu package, what for).
pub const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("7z", "p7zip-full", "Required to unpack the base image"),
    ("unsquashfs", "squashfs-tools", "Required to extract the root filesystem"),
    ("mksquashfs", "squashfs-tools", "Required to recompress the root filesystem"),
    ("xorriso", "xorriso", "Required to generate the bootable image"),
    ("chroot", "coreutils", "Required to run the vendor installer"),
    ("mount", "mount", "Required for chroot mounts"),
    ("umount", "mount", "Required for chroot mounts"),
];

/// Check host tools are installed.
pub fn check_host_tools(config: &BuildConfig) -> Vec<CheckResult> {
    let mut results: Vec<CheckResult> = REQUIRED_TOOLS
        .iter()
        .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose, true))
        .collect();

    // Password hashing only matters when a password will be set.
    let needs_openssl = config.operator.password.is_some();
    results.push(check_tool_exists(
        "openssl",
        "openssl",
        "Required to hash the operator password",
        needs_openssl,
    ));

    if config.autoinstall && config.partition.target_disk.is_some() {
        results.push(check_tool_exists(
            "lsblk",
            "util-linux",
            "Required to inspect the target disk",
            true,
        ));
    } else {
        results.push(CheckResult::skip("lsblk", "no target disk to inspect"));
    }

    if config.minimal {
        results.push(CheckResult::skip("dconf", "minimal build has no desktop defaults"));
    } else {
        results.push(check_tool_exists(
            "dconf",
            "dconf-cli",
            "Compiles desktop defaults; without it they apply after `dconf update` on the target",
            false,
        ));
    }

    results
}

/// Root is required for loop mounts, chroot, and preserving ownership.
pub fn check_privileges() -> CheckResult {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        CheckResult::pass("root privileges")
    } else {
        CheckResult::fail(
            "root privileges",
            &format!("running as uid {}; re-run with sudo", euid),
        )
    }
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match which::which(tool) {
        Ok(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        Err(_) => {
            let msg = format!("Not found. Install: sudo apt install {}. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}
