//! Build environment checks (directories, disk space, operator inputs).

use std::path::Path;

use crate::config::BuildConfig;
use crate::process::Cmd;

use super::types::CheckResult;

/// Unpacked image, root filesystem and the rebuilt image together.
const MIN_FREE_GIB: u64 = 25;

/// Check a directory exists (creating it if needed) and is writable.
fn check_writable(label: &str, dir: &Path) -> CheckResult {
    if let Err(e) = std::fs::create_dir_all(dir) {
        return CheckResult::fail(label, &format!("Cannot create {}: {}", dir.display(), e));
    }
    let probe = dir.join(".preflight-test");
    match std::fs::write(&probe, "test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            CheckResult::pass_with(label, &dir.display().to_string())
        }
        Err(e) => CheckResult::fail(label, &format!("Cannot write to {}: {}", dir.display(), e)),
    }
}

/// Free bytes on the filesystem holding `dir`, via `df`.
fn free_bytes(dir: &Path) -> Option<u64> {
    let result = Cmd::new("df")
        .args(["--output=avail", "-B1"])
        .arg_path(dir)
        .allow_fail()
        .run()
        .ok()?;
    if !result.success() {
        return None;
    }
    result.stdout.lines().nth(1)?.trim().parse().ok()
}

/// Check build environment (directories, space, inputs).
pub fn check_build_environment(config: &BuildConfig) -> Vec<CheckResult> {
    let mut results = vec![
        check_writable("cache/ writable", &config.cache_dir),
        check_writable("work/ writable", &config.work_dir),
        check_writable("output/ writable", &config.output_dir),
        check_writable("logs/ writable", &config.log_dir),
    ];

    match free_bytes(&config.work_dir) {
        Some(avail) => {
            let free_gib = avail / (1024 * 1024 * 1024);
            if free_gib < MIN_FREE_GIB {
                results.push(CheckResult::warn(
                    "disk space",
                    &format!("{}GB free - a build needs ~{}GB", free_gib, MIN_FREE_GIB),
                ));
            } else {
                results.push(CheckResult::pass_with("disk space", &format!("{}GB free", free_gib)));
            }
        }
        None => results.push(CheckResult::skip("disk space", "df unavailable")),
    }

    results.extend(check_operator_inputs(config));
    results
}

/// Inputs that decide whether the build can run unattended.
pub fn check_operator_inputs(config: &BuildConfig) -> Vec<CheckResult> {
    let op = &config.operator;
    let mut results = Vec::new();

    let missing: Vec<&str> = [
        ("callsign", op.callsign.is_some()),
        ("grid square", op.grid_square.is_some()),
        ("operator name", op.fullname.is_some()),
        ("username", op.username.is_some()),
    ]
    .iter()
    .filter(|(_, set)| !set)
    .map(|(name, _)| *name)
    .collect();
    if missing.is_empty() {
        results.push(CheckResult::pass_with("vendor installer inputs", "unattended"));
    } else {
        results.push(CheckResult::warn(
            "vendor installer inputs",
            &format!("installer will prompt for: {}", missing.join(", ")),
        ));
    }

    if config.autoinstall {
        if op.username.is_some() && op.password.is_some() {
            results.push(CheckResult::pass("autoinstall identity"));
        } else {
            results.push(CheckResult::fail(
                "autoinstall identity",
                "EMCOMM_USERNAME and EMCOMM_PASSWORD are required for unattended install",
            ));
        }
        if config.partition.target_disk.is_none() && config.partition.strategy_override.is_some() {
            results.push(CheckResult::fail(
                "partition strategy",
                "a strategy was requested without EMCOMM_TARGET_DISK to check it against",
            ));
        }
    }

    if let Some(dir) = &config.backup_dir {
        if dir.is_dir() {
            results.push(CheckResult::pass_with("backup directory", &dir.display().to_string()));
        } else {
            results.push(CheckResult::warn(
                "backup directory",
                &format!("{} does not exist; backups will be skipped", dir.display()),
            ));
        }
    }

    results
}
