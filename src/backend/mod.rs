//! Package manager backends.
//!
//! One trait, three implementations: dnf against an install root, apt
//! against a seeded sysroot, and apt inside a debootstrapped chroot. The
//! orchestrator in `rootfs` drives whichever one the config selects and
//! never dispatches on the kind again after construction.

pub mod deb;
pub mod external;
pub mod intercept;
pub mod rpm;

use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::config::{BuildConfig, Feed};
use crate::manifest::Manifest;

/// Which package manager assembles the target tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Rpm,
    Deb,
    ExternalDebian,
}

impl BackendKind {
    /// chroot-based installs need real mounts and real chroot.
    pub fn requires_root(&self) -> bool {
        matches!(self, BackendKind::ExternalDebian)
    }

    pub fn create(&self, config: &BuildConfig) -> Result<Box<dyn PackageBackend>> {
        let ctx = BackendContext::from_config(config);
        match self {
            BackendKind::Rpm => Ok(Box::new(rpm::DnfBackend::new(ctx)?)),
            BackendKind::Deb => Ok(Box::new(deb::AptBackend::new(ctx)?)),
            BackendKind::ExternalDebian => {
                let bootstrap = config
                    .bootstrap
                    .clone()
                    .context("external-debian backend needs bootstrap settings")?;
                Ok(Box::new(external::ExternalDebianBackend::new(ctx, bootstrap)?))
            }
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(tag: &str) -> Result<Self> {
        match tag {
            "rpm" => Ok(BackendKind::Rpm),
            "deb" => Ok(BackendKind::Deb),
            "external-debian" => Ok(BackendKind::ExternalDebian),
            other => bail!("Unknown backend '{other}' (expected rpm, deb or external-debian)"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            BackendKind::Rpm => "rpm",
            BackendKind::Deb => "deb",
            BackendKind::ExternalDebian => "external-debian",
        };
        write!(f, "{tag}")
    }
}

/// Everything a backend needs to know about the build, fixed at
/// construction.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub workdir: PathBuf,
    pub target_rootfs: PathBuf,
    pub machine: String,
    /// Package architectures in priority order, lowest first.
    pub package_archs: Vec<String>,
    pub install_recommends: bool,
    pub native_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

impl BackendContext {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            workdir: config.workdir.clone(),
            target_rootfs: config.target_rootfs.clone(),
            machine: config.machine.clone(),
            package_archs: config.package_archs.clone(),
            install_recommends: config.install_recommends,
            native_root: config.native_root.clone(),
            data_dir: config.data_dir.clone(),
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.workdir.join("temp")
    }

    pub fn primary_arch(&self) -> String {
        self.machine.replace('-', "_")
    }

    /// Where distro-provided intercept scripts are staged from, if a data
    /// directory was configured.
    pub fn intercept_source(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("postinst-intercepts"))
    }

    /// Environment under which package scriptlets run offline, pointing
    /// them at the target tree instead of `/`.
    pub fn transaction_env(&self, intercept_dir: &Path) -> Vec<(String, String)> {
        let target = self.target_rootfs.to_string_lossy().into_owned();
        let mut env = vec![
            ("D".to_string(), target.clone()),
            ("OFFLINE_ROOT".to_string(), target.clone()),
            ("IPKG_OFFLINE_ROOT".to_string(), target.clone()),
            ("OPKG_OFFLINE_ROOT".to_string(), target),
            (
                "INTERCEPT_DIR".to_string(),
                intercept_dir.to_string_lossy().into_owned(),
            ),
        ];
        if let Some(native_root) = &self.native_root {
            env.push((
                "NATIVE_ROOT".to_string(),
                native_root.to_string_lossy().into_owned(),
            ));
        }
        env
    }

    /// Create the target and scratch directories. Safe to call repeatedly.
    pub fn prepare_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.target_rootfs).with_context(|| {
            format!(
                "Failed to create target rootfs: {}",
                self.target_rootfs.display()
            )
        })?;
        fs::create_dir_all(self.temp_dir())
            .with_context(|| format!("Failed to create temp dir: {}", self.temp_dir().display()))?;
        Ok(())
    }
}

/// The backend contract the rootfs builder drives.
///
/// `configure` and `set_exclusions` are idempotent; `refresh_index` is
/// fatal on any error; `install` with `attempt_only` logs and swallows
/// individual failures; an empty package list is always a no-op.
pub trait PackageBackend {
    /// Write backend configuration derived from machine and target
    /// metadata. Idempotent.
    fn configure(&mut self) -> Result<()>;

    /// Regenerate the feed registry from the full list; when `persist`,
    /// also write a durable copy into the target tree itself.
    fn register_feeds(&mut self, feeds: &[Feed], persist: bool) -> Result<()>;

    /// Pin the named packages to never-install priority. Re-appliable.
    fn set_exclusions(&mut self, names: &[String]) -> Result<()>;

    /// Currently pinned-out package names.
    fn exclusions(&self) -> &[String];

    /// Refresh the package index. No partial state on failure.
    fn refresh_index(&mut self) -> Result<()>;

    fn install(&mut self, names: &[String], attempt_only: bool) -> Result<()>;

    /// When `with_dependencies` is false, removal goes through the
    /// lower-level tool and bypasses dependency checks.
    fn remove(&mut self, names: &[String], with_dependencies: bool) -> Result<()>;

    /// Snapshot of the backend's live database, never a cache.
    fn list_installed(&mut self) -> Result<Manifest>;

    /// Run every registered postinstall intercept; triage failures per
    /// `intercept::classify_failure`.
    fn run_intercepts(&mut self) -> Result<()>;

    /// Mark the named packages as not fully installed and persist their
    /// scriptlet bodies for first-boot execution.
    fn handle_intercept_failure(&mut self, packages: &[String]) -> Result<()>;

    /// Backend hook run after the external install pass, before intercepts.
    fn post_install(&mut self) -> Result<()> {
        Ok(())
    }

    /// Install companion packages derived from globs over the installed
    /// set, best effort.
    fn install_complementary(&mut self, globs: &[String]) -> Result<()> {
        if globs.is_empty() {
            return Ok(());
        }

        debug!("Installing complementary packages ({})", globs.join(" "));
        let installed = self.list_installed()?;
        let plan = complementary_plan(&installed, globs, self.exclusions());

        if !plan.skipped.is_empty() {
            debug!(
                "Skipping already provided packages: {}",
                plan.skipped.join(" ")
            );
        }
        self.install(&plan.install, true)
    }
}

/// What a complementary pass will do.
#[derive(Debug, Clone, Default)]
pub struct ComplementaryPlan {
    /// Candidates to install, best effort, sorted.
    pub install: Vec<String>,
    /// Candidates dropped because an installed package already provides
    /// them, sorted.
    pub skipped: Vec<String>,
}

/// Expand companion globs against the installed set.
///
/// A leading `*` stands for every installed package name, so `*-dev`
/// yields `bash-dev` for an installed `bash`. Candidates equal to an
/// installed name install nothing new and are dropped; candidates provided
/// under a virtual name are reported as skipped; excluded names never make
/// the list.
pub fn complementary_plan(
    installed: &Manifest,
    globs: &[String],
    excluded: &[String],
) -> ComplementaryPlan {
    let provided = installed.provided_names();

    let mut candidates = BTreeSet::new();
    for glob in globs {
        match glob.strip_prefix('*') {
            Some(suffix) => {
                for name in installed.names() {
                    candidates.insert(format!("{name}{suffix}"));
                }
            }
            None => {
                candidates.insert(glob.clone());
            }
        }
    }

    let mut plan = ComplementaryPlan::default();
    for candidate in candidates {
        if installed.contains(&candidate) {
            continue;
        }
        if provided.contains(&candidate) {
            plan.skipped.push(candidate);
        } else if !excluded.iter().any(|name| name == &candidate) {
            plan.install.push(candidate);
        }
    }
    plan
}

/// True when a feed URI points into our own workdir or target tree. Such
/// a feed would make the package manager read the image it is in the
/// middle of writing, so backends leave it out of the transient registry.
pub(crate) fn is_self_referential(feed: &Feed, workdir: &Path, target_rootfs: &Path) -> bool {
    let path = feed.uri.strip_prefix("file://").unwrap_or(&feed.uri);
    Path::new(path).starts_with(workdir) || Path::new(path).starts_with(target_rootfs)
}
