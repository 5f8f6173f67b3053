//! Preflight check results and the printed report.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    /// Blocks the build.
    Fail,
    Warn,
    /// Not applicable to this configuration.
    Skip,
}

impl CheckStatus {
    fn marker(self) -> (&'static str, &'static str) {
        match self {
            CheckStatus::Pass => ("✓", "PASS"),
            CheckStatus::Fail => ("✗", "FAIL"),
            CheckStatus::Warn => ("⚠", "WARN"),
            CheckStatus::Skip => ("○", "SKIP"),
        }
    }
}

/// One named host or configuration check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, details: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            status,
            details: details.map(str::to_string),
        }
    }

    pub fn pass(name: &str) -> Self {
        Self::new(name, CheckStatus::Pass, None)
    }

    pub fn pass_with(name: &str, details: &str) -> Self {
        Self::new(name, CheckStatus::Pass, Some(details))
    }

    pub fn fail(name: &str, details: &str) -> Self {
        Self::new(name, CheckStatus::Fail, Some(details))
    }

    pub fn warn(name: &str, details: &str) -> Self {
        Self::new(name, CheckStatus::Warn, Some(details))
    }

    pub fn skip(name: &str, details: &str) -> Self {
        Self::new(name, CheckStatus::Skip, Some(details))
    }

    fn line(&self) -> String {
        let (icon, label) = self.status.marker();
        match &self.details {
            Some(d) => format!("  {} [{}] {}: {}", icon, label, self.name, d),
            None => format!("  {} [{}] {}", icon, label, self.name),
        }
    }
}

pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    /// No check failed. Warnings and skips do not count against it.
    pub fn all_passed(&self) -> bool {
        self.fail_count() == 0
    }

    pub fn fail_count(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn warn_count(&self) -> usize {
        self.count(CheckStatus::Warn)
    }

    pub fn print(&self) {
        println!("Host checks\n");
        for check in &self.checks {
            println!("{}", check.line());
        }

        println!(
            "\n{} of {} checks passed",
            self.count(CheckStatus::Pass),
            self.checks.len()
        );
        match (self.fail_count(), self.warn_count()) {
            (0, 0) => {}
            (0, w) => println!("{} warning(s)", w),
            (f, 0) => println!("{} failed; the build will refuse to start", f),
            (f, w) => println!(
                "{} failed; the build will refuse to start ({} warning(s))",
                f, w
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let report = PreflightReport {
            checks: vec![
                CheckResult::pass("xorriso"),
                CheckResult::fail("root", "not root"),
                CheckResult::warn("disk space", "low"),
                CheckResult::skip("dconf", "minimal build"),
            ],
        };
        assert!(!report.all_passed());
        assert_eq!(report.fail_count(), 1);
        assert_eq!(report.warn_count(), 1);
    }

    #[test]
    fn test_warnings_do_not_block() {
        let report = PreflightReport {
            checks: vec![CheckResult::warn("disk space", "low"), CheckResult::pass("7z")],
        };
        assert!(report.all_passed());
    }

    #[test]
    fn test_line_format() {
        assert_eq!(CheckResult::pass("7z").line(), "  ✓ [PASS] 7z");
        assert_eq!(
            CheckResult::fail("root", "run with sudo").line(),
            "  ✗ [FAIL] root: run with sudo"
        );
    }
}
