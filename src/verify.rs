//! Post-build verification.
//!
//! Inspects the finished image and the trees it was built from. The report is
//! informational unless strict verification is on, in which case any failed
//! critical check fails the build.

use std::fs;
use std::path::Path;

use crate::error::BuildError;
use crate::pipeline::steps::{keyfile_name, CONNECTIONS_DIR, DISK_INFO, RELEASE_FILE, VENDOR_STAGING};
use crate::pipeline::BuildContext;
use crate::preseed::{self, BOOT_CONFIGS, DESCRIPTOR_NAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub severity: Severity,
    pub passed: bool,
    pub details: Option<String>,
}

impl Check {
    fn new(name: &str, severity: Severity, passed: bool, details: impl Into<String>) -> Self {
        let details = details.into();
        Self {
            name: name.to_string(),
            severity,
            passed,
            details: (!details.is_empty()).then_some(details),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub checks: Vec<Check>,
}

impl VerificationReport {
    pub fn pass_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    /// Failed warning-level checks.
    pub fn warn_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.severity == Severity::Warning)
            .count()
    }

    /// Failed critical checks.
    pub fn fail_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.severity == Severity::Critical)
            .count()
    }

    pub fn print(&self) {
        println!("\n=== Verification Results ===\n");
        for check in &self.checks {
            let (icon, status) = match (check.passed, check.severity) {
                (true, _) => ("✓", "PASS"),
                (false, Severity::Warning) => ("⚠", "WARN"),
                (false, Severity::Critical) => ("✗", "FAIL"),
            };
            print!("  {} [{}] {}", icon, status, check.name);
            match &check.details {
                Some(details) => println!(": {}", details),
                None => println!(),
            }
        }
        println!();
        println!("Summary: {}/{} passed", self.pass_count(), self.checks.len());
        if self.fail_count() > 0 {
            println!("         {} critical check(s) FAILED", self.fail_count());
        }
        if self.warn_count() > 0 {
            println!("         {} warnings", self.warn_count());
        }
    }

    /// With `strict`, failed critical checks become a build failure.
    pub fn enforce(&self, strict: bool) -> Result<(), BuildError> {
        let failed = self.fail_count();
        if strict && failed > 0 {
            return Err(BuildError::Verification(failed));
        }
        Ok(())
    }
}

fn read(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

/// Run every check against a finished build.
pub fn verify(ctx: &BuildContext<'_>) -> VerificationReport {
    let mut checks = Vec::new();
    let config = ctx.config;
    let rootfs = ctx.rootfs();
    let tree = ctx.iso_tree();

    let output = ctx.output_image();
    let size = fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
    checks.push(Check::new(
        "output image",
        Severity::Critical,
        size > 0,
        if size > 0 {
            format!("{} ({} MB)", output.display(), size / 1024 / 1024)
        } else {
            format!("{} missing or empty", output.display())
        },
    ));

    let squashfs = &ctx.image.squashfs;
    checks.push(Check::new(
        "root filesystem image",
        Severity::Critical,
        squashfs.is_file(),
        squashfs.display().to_string(),
    ));
    checks.push(Check::new(
        "filesystem.size",
        Severity::Warning,
        squashfs.with_extension("size").is_file(),
        "",
    ));

    let hostname = read(&rootfs.join("etc/hostname")).unwrap_or_default();
    let hostname = hostname.trim();
    checks.push(Check::new(
        "hostname",
        Severity::Critical,
        hostname == config.operator.hostname,
        format!("expected {}, found '{}'", config.operator.hostname, hostname),
    ));

    if !config.operator.wifi.is_empty() {
        let dir = rootfs.join(CONNECTIONS_DIR);
        let missing: Vec<&str> = config
            .operator
            .wifi
            .iter()
            .filter(|n| !dir.join(keyfile_name(&n.ssid)).is_file())
            .map(|n| n.ssid.as_str())
            .collect();
        checks.push(Check::new(
            "WiFi profiles",
            Severity::Warning,
            missing.is_empty(),
            if missing.is_empty() {
                String::new()
            } else {
                format!("missing: {}", missing.join(", "))
            },
        ));
    }

    let tag = &ctx.release.tag;
    let in_tree = read(&tree.join(DISK_INFO)).is_some_and(|s| s.contains(tag.as_str()));
    let in_rootfs = read(&rootfs.join(RELEASE_FILE))
        .is_some_and(|s| s.contains(&format!("ET_RELEASE={}\n", tag)));
    checks.push(Check::new(
        "release label",
        Severity::Critical,
        in_tree && in_rootfs,
        format!("image tree: {}, rootfs: {}", in_tree, in_rootfs),
    ));

    let staging = rootfs.join(VENDOR_STAGING);
    checks.push(Check::new(
        "vendor staging removed",
        Severity::Critical,
        !staging.exists(),
        if staging.exists() {
            format!("{} still present", staging.display())
        } else {
            String::new()
        },
    ));

    if config.autoinstall {
        checks.push(Check::new(
            "autoinstall descriptor",
            Severity::Critical,
            tree.join(DESCRIPTOR_NAME).is_file(),
            "",
        ));
        let flagged = BOOT_CONFIGS
            .iter()
            .filter_map(|rel| read(&tree.join(rel)))
            .map(|text| preseed::has_autoinstall_flags(&text))
            .collect::<Vec<_>>();
        checks.push(Check::new(
            "boot entries",
            Severity::Critical,
            !flagged.is_empty() && flagged.iter().all(|f| *f),
            format!("{} boot config(s) checked", flagged.len()),
        ));
    }

    VerificationReport { checks }
}
