use anyhow::Result;

use crate::config::BuildConfig;
use crate::preflight;

/// `emcomm-iso preflight`. Without `strict` a failing host only prints.
pub fn cmd_preflight(config: &BuildConfig, strict: bool) -> Result<()> {
    if strict {
        return preflight::ensure_ready(config);
    }
    let report = preflight::run_checks(config);
    report.print();
    if !report.all_passed() {
        println!("\n`build` refuses to start until the failed checks pass.");
    }
    Ok(())
}
