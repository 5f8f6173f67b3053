//! Host readiness checks.
//!
//! Everything a build needs from the machine it runs on: the external tools,
//! root privileges, free space next to the work tree, and a configuration
//! that resolves. Nothing is downloaded or mounted while checking.

mod environment;
mod host_tools;
mod types;

use anyhow::Result;
use tracing::info;

use crate::config::BuildConfig;
use crate::error::BuildError;

pub use host_tools::REQUIRED_TOOLS;
pub use types::{CheckResult, CheckStatus, PreflightReport};

pub fn run_checks(config: &BuildConfig) -> PreflightReport {
    let mut checks = host_tools::check_host_tools(config);
    checks.push(host_tools::check_privileges());
    checks.extend(environment::check_build_environment(config));
    PreflightReport { checks }
}

/// Print the report and turn any failed check into
/// [`BuildError::Prerequisite`] naming every failure.
pub fn ensure_ready(config: &BuildConfig) -> Result<()> {
    let report = run_checks(config);
    report.print();

    let failed: Vec<&str> = report
        .checks
        .iter()
        .filter(|c| c.status == CheckStatus::Fail)
        .map(|c| c.name.as_str())
        .collect();
    if !failed.is_empty() {
        return Err(BuildError::Prerequisite(failed.join(", ")).into());
    }

    info!(warnings = report.warn_count(), "host is ready");
    Ok(())
}
