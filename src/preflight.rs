//! Preflight checks for an image build.
//!
//! Validates host tools, privileges and feed reachability before a build
//! starts, so problems surface in seconds instead of minutes into an
//! install transaction. Run with `rootstrap preflight`.

use std::fs;
use std::path::Path;

use anyhow::{bail, Result};

use crate::backend::BackendKind;
use crate::config::{BuildConfig, Feed};
use crate::fakeroot;
use crate::process::Cmd;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Check failed, the build cannot succeed.
    Fail,
    /// Check passed but with a warning.
    Warn,
    /// Check not applicable to this configuration.
    Skip,
}

impl CheckResult {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: None,
        }
    }

    fn pass_with(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: Some(details.to_string()),
        }
    }

    fn fail(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            details: Some(details.to_string()),
        }
    }

    fn warn(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            details: Some(details.to_string()),
        }
    }

    fn skip(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Skip,
            details: Some(details.to_string()),
        }
    }
}

/// Results of all preflight checks.
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Returns true if no check failed.
    pub fn all_passed(&self) -> bool {
        !self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }

    pub fn fail_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .count()
    }

    pub fn warn_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Warn)
            .count()
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        println!("=== Preflight Check Results ===\n");

        for check in &self.checks {
            let icon = match check.status {
                CheckStatus::Pass => "✓",
                CheckStatus::Fail => "✗",
                CheckStatus::Warn => "⚠",
                CheckStatus::Skip => "○",
            };

            let status_str = match check.status {
                CheckStatus::Pass => "PASS",
                CheckStatus::Fail => "FAIL",
                CheckStatus::Warn => "WARN",
                CheckStatus::Skip => "SKIP",
            };

            print!("  {} [{}] {}", icon, status_str, check.name);
            if let Some(details) = &check.details {
                println!(": {}", details);
            } else {
                println!();
            }
        }

        println!();
        let total = self.checks.len();
        let passed = self
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Pass)
            .count();
        let failed = self.fail_count();
        let warned = self.warn_count();

        println!("Summary: {}/{} passed", passed, total);
        if failed > 0 {
            println!("         {} FAILED - build will not succeed", failed);
        }
        if warned > 0 {
            println!("         {} warnings", warned);
        }
    }
}

/// Run all preflight checks for the given build configuration.
pub fn run_preflight(config: &BuildConfig) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Running preflight checks...\n");

    println!("Checking backend tools...");
    checks.extend(check_backend_tools(config.backend));

    println!("Checking privileges...");
    checks.push(check_privileges(config));

    println!("Checking package feeds...");
    checks.extend(check_feeds(&config.feeds));

    println!("Checking build environment...");
    checks.extend(check_build_environment(config));

    println!();

    PreflightReport { checks }
}

/// Check the tools the selected backend will invoke.
fn check_backend_tools(backend: BackendKind) -> Vec<CheckResult> {
    let required: &[(&str, &str, &str)] = match backend {
        BackendKind::Rpm => &[
            ("dnf", "dnf", "Resolves and installs rpm packages"),
            (
                "rpm",
                "rpm",
                "Queries the rpm database and runs low-level removals",
            ),
        ],
        BackendKind::Deb => &[
            ("apt-get", "apt", "Resolves and installs deb packages"),
            ("dpkg", "dpkg", "Unpacks deb packages and tracks install state"),
            ("dpkg-query", "dpkg", "Reads the installed package database"),
        ],
        BackendKind::ExternalDebian => &[
            (
                "debootstrap",
                "debootstrap",
                "Bootstraps the base Debian system",
            ),
            ("chroot", "coreutils", "Runs apt inside the bootstrapped tree"),
            ("dpkg", "dpkg", "Unpacks deb packages and tracks install state"),
            ("dpkg-query", "dpkg", "Reads the installed package database"),
        ],
    };

    let mut results = Vec::new();
    for (tool, package, purpose) in required {
        results.push(check_tool(tool, package, purpose, true));
    }

    // Hooks and generated scriptlet wrappers run through bash.
    results.push(check_tool(
        "bash",
        "bash",
        "Runs rootfs hooks and scriptlet wrappers",
        true,
    ));
    // Only needed when the image ships kernel modules.
    results.push(check_tool(
        "depmod",
        "kmod",
        "Generates kernel module dependency indexes",
        false,
    ));

    results
}

/// Check whether a tool exists in PATH.
fn check_tool(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match which::which(tool) {
        Ok(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        Err(_) => {
            let msg = format!("Not found. Install '{}'. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}

/// Root for the external backend, pseudo availability for the others.
fn check_privileges(config: &BuildConfig) -> CheckResult {
    let euid = unsafe { libc::geteuid() };

    if config.backend.requires_root() {
        if euid == 0 {
            return CheckResult::pass_with("privileges", "running as root");
        }
        return CheckResult::fail(
            "privileges",
            "The external-debian backend chroots into the target and needs real root. \
             Run again with sudo.",
        );
    }

    if euid == 0 {
        return CheckResult::pass_with("privileges", "running as root, fake root not needed");
    }
    match fakeroot::libpseudo_available(config.native_root.as_deref()) {
        Some(lib) => CheckResult::pass_with("fake root", &lib.display().to_string()),
        None => CheckResult::fail(
            "fake root",
            "libpseudo.so not found. Install pseudo or set 'native_root' to a \
             sysroot that carries it.",
        ),
    }
}

/// Local feeds must exist on disk; remote feeds are not probed.
fn check_feeds(feeds: &[Feed]) -> Vec<CheckResult> {
    if feeds.is_empty() {
        return vec![CheckResult::warn(
            "package feeds",
            "No feeds configured. Installation will fail unless the backend \
             already knows its repositories.",
        )];
    }

    let mut results = Vec::new();
    for feed in feeds {
        let name = format!("feed {}", feed.uri);
        match feed.uri.strip_prefix("file://") {
            Some(path) => {
                if Path::new(path).is_dir() {
                    results.push(CheckResult::pass(&name));
                } else {
                    results.push(CheckResult::fail(&name, "Local feed directory does not exist"));
                }
            }
            None => results.push(CheckResult::skip(&name, "remote feed, not probed")),
        }
    }
    results
}

/// Check directories, intercept scripts and disk space.
fn check_build_environment(config: &BuildConfig) -> Vec<CheckResult> {
    let mut results = Vec::new();

    let probe = config.workdir.join(".preflight-probe");
    let writable = fs::create_dir_all(&config.workdir)
        .and_then(|_| fs::write(&probe, "probe"))
        .and_then(|_| fs::remove_file(&probe));
    match writable {
        Ok(()) => results.push(CheckResult::pass("workdir writable")),
        Err(e) => results.push(CheckResult::fail(
            "workdir writable",
            &format!("Cannot write to {}: {}", config.workdir.display(), e),
        )),
    }

    if let Some(data_dir) = &config.data_dir {
        let dir = data_dir.join("postinst-intercepts");
        if dir.is_dir() {
            let count = fs::read_dir(&dir)
                .map(|entries| entries.filter_map(|e| e.ok()).count())
                .unwrap_or(0);
            results.push(CheckResult::pass_with(
                "postinst intercepts",
                &format!("{} scripts", count),
            ));
        } else {
            results.push(CheckResult::warn(
                "postinst intercepts",
                &format!("{} not found, intercepts will not run", dir.display()),
            ));
        }
    }

    // Rough free-space check through df; skipped quietly when df is absent.
    if let Ok(result) = Cmd::new("df")
        .args(["--output=avail", "-B1"])
        .arg(config.workdir.to_string_lossy())
        .allow_fail()
        .run()
    {
        if result.success() {
            if let Some(avail) = result.stdout.lines().nth(1) {
                if let Ok(avail_bytes) = avail.trim().parse::<u64>() {
                    let free_gb = avail_bytes / (1024 * 1024 * 1024);
                    if free_gb < 10 {
                        results.push(CheckResult::warn(
                            "disk space",
                            &format!("{}GB free - a full image build can need more", free_gb),
                        ));
                    } else {
                        results.push(CheckResult::pass_with(
                            "disk space",
                            &format!("{}GB free", free_gb),
                        ));
                    }
                }
            }
        }
    }

    results
}

/// Run preflight and bail if any check fails.
pub fn run_preflight_or_fail(config: &BuildConfig) -> Result<()> {
    let report = run_preflight(config);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let report = PreflightReport {
            checks: vec![
                CheckResult::pass("a"),
                CheckResult::fail("b", "broken"),
                CheckResult::warn("c", "odd"),
                CheckResult::skip("d", "not applicable"),
            ],
        };

        assert!(!report.all_passed());
        assert_eq!(report.fail_count(), 1);
        assert_eq!(report.warn_count(), 1);
    }

    #[test]
    fn test_all_passed_ignores_warnings() {
        let report = PreflightReport {
            checks: vec![CheckResult::pass("a"), CheckResult::warn("b", "odd")],
        };
        assert!(report.all_passed());
    }

    #[test]
    fn test_check_tool_found_and_missing() {
        let found = check_tool("sh", "sh", "always present", true);
        assert_eq!(found.status, CheckStatus::Pass);

        let missing = check_tool("definitely-not-a-real-tool-42", "nope", "never present", true);
        assert_eq!(missing.status, CheckStatus::Fail);

        let soft = check_tool("definitely-not-a-real-tool-42", "nope", "never present", false);
        assert_eq!(soft.status, CheckStatus::Warn);
    }

    #[test]
    fn test_feed_checks() {
        let dir = tempfile::tempdir().unwrap();
        let feeds = vec![
            Feed {
                uri: format!("file://{}", dir.path().display()),
                extra: Vec::new(),
            },
            Feed {
                uri: "file:///does/not/exist".to_string(),
                extra: Vec::new(),
            },
            Feed {
                uri: "https://feeds.example.com/main".to_string(),
                extra: vec!["stable".to_string(), "main".to_string()],
            },
        ];

        let results = check_feeds(&feeds);

        assert_eq!(results[0].status, CheckStatus::Pass);
        assert_eq!(results[1].status, CheckStatus::Fail);
        assert_eq!(results[2].status, CheckStatus::Skip);
    }

    #[test]
    fn test_no_feeds_is_a_warning() {
        let results = check_feeds(&[]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CheckStatus::Warn);
    }
}
