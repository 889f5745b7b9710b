//! Rootfs assembly orchestration.
//!
//! `RootfsBuilder` drives a package backend through the fixed sequence that
//! turns an empty directory into a populated root filesystem: backend
//! configuration, feed registration, three installation waves (base,
//! complementary, external), manifest capture, post-install fixups and
//! postinstall intercepts, finishing with kernel module dependency
//! generation. Progress is tracked as a monotone `BuildStage` so a failed
//! build reports exactly how far it got.

mod scripts;

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::backend::PackageBackend;
use crate::config::BuildConfig;
use crate::fakeroot;
use crate::manifest::Manifest;
use crate::process::Cmd;

// ============================================================================
// Build stages
// ============================================================================

/// Checkpoints of a rootfs build, in execution order.
///
/// Stages only ever advance by one step; `RootfsBuilder` rejects any other
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BuildStage {
    /// Nothing has happened yet.
    Init = 0,
    /// Backend configuration files are in place.
    Configured = 1,
    /// Package feeds are registered with the backend.
    FeedsRegistered = 2,
    /// Exclusion pins are active.
    Excluded = 3,
    /// The package index is refreshed from the feeds.
    IndexFresh = 4,
    /// The base package set is installed.
    BaseInstalled = 5,
    /// Complementary glob matches are installed.
    ComplementaryInstalled = 6,
    /// External packages are installed.
    ExternalInstalled = 7,
    /// The installed set is captured in the manifest files.
    ManifestSaved = 8,
    /// Backend post-install fixups are done.
    PostInstalled = 9,
    /// Postinstall intercepts have run.
    InterceptsRun = 10,
    /// The rootfs is complete.
    Done = 11,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Init => "init",
            BuildStage::Configured => "configured",
            BuildStage::FeedsRegistered => "feeds-registered",
            BuildStage::Excluded => "excluded",
            BuildStage::IndexFresh => "index-fresh",
            BuildStage::BaseInstalled => "base-installed",
            BuildStage::ComplementaryInstalled => "complementary-installed",
            BuildStage::ExternalInstalled => "external-installed",
            BuildStage::ManifestSaved => "manifest-saved",
            BuildStage::PostInstalled => "post-installed",
            BuildStage::InterceptsRun => "intercepts-run",
            BuildStage::Done => "done",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// Workspace preparation
// ============================================================================

/// Create the work directory and wipe state left over from earlier builds.
///
/// With `no_clean` the existing rootfs and the fake root state survive, so a
/// build can resume on top of a previous one.
pub fn prepare_workspace(config: &BuildConfig) -> Result<()> {
    fs::create_dir_all(&config.workdir).with_context(|| {
        format!(
            "Failed to create work directory {}",
            config.workdir.display()
        )
    })?;

    if config.no_clean {
        debug!("Keeping previously generated rootfs");
        return Ok(());
    }

    let stale = [
        config.target_rootfs.clone(),
        fakeroot::state_dir(&config.workdir, &config.target_rootfs),
    ];
    for dir in stale {
        if dir.exists() {
            debug!("Removing {}", dir.display());
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
    }
    Ok(())
}

// ============================================================================
// Builder
// ============================================================================

/// Drives a package backend through a complete rootfs build.
pub struct RootfsBuilder {
    config: BuildConfig,
    backend: Box<dyn PackageBackend>,
    stage: BuildStage,
    installed: Manifest,
}

impl RootfsBuilder {
    /// Create a builder with the backend named in the configuration.
    pub fn new(config: BuildConfig) -> Result<Self> {
        let backend = config.backend.create(&config)?;
        Ok(Self::with_backend(config, backend))
    }

    /// Create a builder around an already constructed backend.
    pub fn with_backend(config: BuildConfig, backend: Box<dyn PackageBackend>) -> Self {
        Self {
            config,
            backend,
            stage: BuildStage::Init,
            installed: Manifest::default(),
        }
    }

    pub fn stage(&self) -> BuildStage {
        self.stage
    }

    /// Packages present in the rootfs as of the manifest capture stage.
    pub fn installed(&self) -> &Manifest {
        &self.installed
    }

    fn advance(&mut self, to: BuildStage) -> Result<()> {
        if to as u8 != self.stage as u8 + 1 {
            bail!("Build stage '{to}' cannot follow '{}'", self.stage);
        }
        debug!("Build stage complete: {to}");
        self.stage = to;
        Ok(())
    }

    /// Run the full build sequence.
    pub fn create(&mut self) -> Result<()> {
        println!("=== Building rootfs for {} ===", self.config.image_name);

        self.run_hooks(&self.config.rootfs_pre_scripts)?;

        self.configure()?;
        self.register_feeds()?;
        self.apply_exclusions()?;
        self.refresh_index()?;
        self.install_base()?;
        self.install_complementary()?;
        self.install_external()?;
        self.save_manifest()?;
        self.post_install()?;
        self.run_intercepts()?;

        self.run_hooks(&self.config.rootfs_post_scripts)?;
        self.generate_kernel_module_deps()?;

        self.advance(BuildStage::Done)?;
        println!("  Rootfs ready: {}", self.config.target_rootfs.display());
        Ok(())
    }

    fn configure(&mut self) -> Result<()> {
        println!("  Configuring {} backend", self.config.backend);
        self.backend.configure()?;
        self.advance(BuildStage::Configured)
    }

    fn register_feeds(&mut self) -> Result<()> {
        // Feeds stay usable inside the image only when the image carries its
        // own package manager.
        let persist = self.config.selection.installs_package_manager();
        self.backend.register_feeds(&self.config.feeds, persist)?;
        self.advance(BuildStage::FeedsRegistered)
    }

    fn apply_exclusions(&mut self) -> Result<()> {
        self.backend
            .set_exclusions(&self.config.selection.excluded)?;
        self.advance(BuildStage::Excluded)
    }

    fn refresh_index(&mut self) -> Result<()> {
        self.backend.refresh_index()?;
        self.advance(BuildStage::IndexFresh)
    }

    fn install_base(&mut self) -> Result<()> {
        println!(
            "  Installing {} packages",
            self.config.selection.packages.len()
        );
        self.backend
            .install(&self.config.selection.packages, false)?;
        self.advance(BuildStage::BaseInstalled)
    }

    fn install_complementary(&mut self) -> Result<()> {
        self.backend
            .install_complementary(&self.config.pkg_globs)?;
        self.advance(BuildStage::ComplementaryInstalled)
    }

    fn install_external(&mut self) -> Result<()> {
        let external = &self.config.selection.external;
        if !external.is_empty() {
            let installed = self.backend.list_installed()?;
            warn_duplicates(&self.config.selection.packages, external, &installed);
            println!("  Installing {} external packages", external.len());
        }
        self.backend
            .install(&self.config.selection.external, false)?;
        self.advance(BuildStage::ExternalInstalled)
    }

    fn save_manifest(&mut self) -> Result<()> {
        let manifest = self.backend.list_installed()?;

        manifest.save_json(&self.config.workdir.join("packages.json"))?;
        let image_manifest = self.config.workdir.join(format!(
            "{}-{}.manifest",
            self.config.image_name, self.config.machine
        ));
        manifest.save_image_manifest(&image_manifest)?;

        println!(
            "  Captured manifest of {} packages: {}",
            manifest.len(),
            image_manifest.display()
        );
        self.installed = manifest;
        self.advance(BuildStage::ManifestSaved)
    }

    fn post_install(&mut self) -> Result<()> {
        self.backend.post_install()?;
        self.advance(BuildStage::PostInstalled)
    }

    fn run_intercepts(&mut self) -> Result<()> {
        self.backend.run_intercepts()?;
        self.advance(BuildStage::InterceptsRun)
    }

    fn run_hooks(&self, hooks: &[String]) -> Result<()> {
        if hooks.is_empty() {
            return Ok(());
        }
        println!("  Running {} rootfs hooks", hooks.len());
        let scratch = self.config.workdir.join("temp");
        for hook in hooks {
            scripts::run_hook(
                hook,
                &self.config.target_rootfs,
                &self.config.machine,
                &scratch,
            )?;
        }
        Ok(())
    }

    /// Regenerate module dependency indexes for every kernel in the image.
    /// Images without kernel modules skip depmod entirely.
    fn generate_kernel_module_deps(&self) -> Result<()> {
        let modules_dir = self.config.target_rootfs.join("lib/modules");
        if !has_kernel_modules(&modules_dir) {
            info!("No kernel modules found, not running depmod");
            return Ok(());
        }

        let entries = fs::read_dir(&modules_dir)
            .with_context(|| format!("Failed to read {}", modules_dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(kernel_version) = name.to_str() else {
                continue;
            };
            println!("  Running depmod for kernel {kernel_version}");
            Cmd::new("depmod")
                .arg("-a")
                .arg("-b")
                .arg_path(&self.config.target_rootfs)
                .arg(kernel_version)
                .error_msg("Could not generate kernel module dependencies")
                .run()?;
        }
        Ok(())
    }
}

fn has_kernel_modules(modules_dir: &Path) -> bool {
    WalkDir::new(modules_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.path().extension().is_some_and(|ext| ext == "ko"))
}

/// Split the overlap between `external` and the rest of the build into names
/// listed in both request lists and names that only arrived as dependencies
/// of the base set. Both halves come back sorted.
fn duplicate_report(
    packages: &[String],
    external: &[String],
    installed: &Manifest,
) -> (Vec<String>, Vec<String>) {
    let external_set: BTreeSet<&str> = external.iter().map(String::as_str).collect();
    let explicit: BTreeSet<&str> = packages
        .iter()
        .map(String::as_str)
        .filter(|p| external_set.contains(p))
        .collect();
    let implicit: BTreeSet<&str> = installed
        .names()
        .filter(|n| external_set.contains(n) && !explicit.contains(n))
        .collect();

    (
        explicit.into_iter().map(str::to_string).collect(),
        implicit.into_iter().map(str::to_string).collect(),
    )
}

fn warn_duplicates(packages: &[String], external: &[String], installed: &Manifest) {
    let (explicit, implicit) = duplicate_report(packages, external, installed);
    if !explicit.is_empty() {
        warn!(
            "The following packages are specified both in external-packages and packages:\n\t{}",
            explicit.join("\n\t")
        );
    }
    if !implicit.is_empty() {
        warn!(
            "The following packages are specified in external-packages, \
             but are brought in by dependencies of packages:\n\t{}",
            implicit.join("\n\t")
        );
    }
}
