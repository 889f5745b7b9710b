//! Bootstrapped Debian backend: debootstrap lays down a stock Debian base
//! system, then apt runs inside a chroot of the target.
//!
//! Unlike the offline backends this one executes the target's own package
//! tooling, so it needs real root for the chroot and the bind mounts. No
//! privilege emulation applies here.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{BootstrapConfig, Feed};
use crate::manifest::Manifest;
use crate::mounts::BindMounts;
use crate::process::Cmd;

use super::deb::{debian_arch_map, exclusion_pins, mark_packages, query_installed, sources_line};
use super::{BackendContext, PackageBackend};

/// PATH for every chrooted command, ignoring whatever the host has.
const CHROOT_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// debootstrap keeps its state under this directory in the target while a
/// bootstrap is pending. Its presence means the base system does not need
/// another pass.
const BOOTSTRAP_SENTINEL: &str = "debootstrap";

/// Host leftovers that have no place in a deployable image.
const BOOTSTRAP_CRUFT: &[&str] = &[
    "root/.profile",
    "root/.bashrc",
    "dev",
    "proc",
    "root/.bash_history",
    "etc/grub.d/05_debian_theme",
    "etc/grub.d/30_uefi-firmware",
];

pub struct ExternalDebianBackend {
    ctx: BackendContext,
    bootstrap: BootstrapConfig,
    debootstrap: PathBuf,
    dpkg: PathBuf,
    dpkg_query: PathBuf,
    exclusions: Vec<String>,
}

impl ExternalDebianBackend {
    pub fn new(ctx: BackendContext, bootstrap: BootstrapConfig) -> Result<Self> {
        if unsafe { libc::geteuid() } != 0 {
            bail!("The external-debian backend needs real root for chroot, run again with sudo");
        }
        ctx.prepare_dirs()?;
        let debootstrap = which::which("debootstrap").context(
            "Could not find 'debootstrap' in PATH. Install debootstrap to build external images",
        )?;
        let dpkg = which::which("dpkg")
            .context("Could not find 'dpkg' in PATH. Install dpkg to build external images")?;
        let dpkg_query = which::which("dpkg-query")
            .context("Could not find 'dpkg-query' in PATH. Install dpkg to build external images")?;
        Ok(Self {
            ctx,
            bootstrap,
            debootstrap,
            dpkg,
            dpkg_query,
            exclusions: Vec::new(),
        })
    }

    fn chroot_apt(&self, args: &[String], attempt_only: bool) -> Result<crate::process::CommandResult> {
        let mut cmd = Cmd::new("chroot")
            .arg_path(&self.ctx.target_rootfs)
            .arg("apt")
            .args(args)
            .env("PATH", CHROOT_PATH)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .error_msg("Could not invoke apt in the target");
        if attempt_only {
            cmd = cmd.allow_fail();
        }
        cmd.run()
    }

    fn write_preferences(&self) -> Result<()> {
        let path = self.ctx.target_rootfs.join("etc/apt/preferences");
        let base = self.bootstrap.preferences.as_deref().unwrap_or("");
        fs::write(&path, assemble_preferences(base, &self.exclusions))
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

impl PackageBackend for ExternalDebianBackend {
    fn configure(&mut self) -> Result<()> {
        if self.ctx.target_rootfs.join(BOOTSTRAP_SENTINEL).exists() {
            debug!("Base system already bootstrapped, skipping debootstrap");
            return Ok(());
        }

        debug!(
            "debootstrap {} from {}",
            self.bootstrap.distro, self.bootstrap.mirror
        );
        Cmd::new(self.debootstrap.to_string_lossy())
            .args(debootstrap_args(
                &self.bootstrap,
                &self.ctx.machine,
                &self.ctx.target_rootfs,
            ))
            // skip the arch sanity check, foreign bootstraps run under
            // binfmt emulation
            .env("ARCH_TEST", "do-not-arch-test")
            .error_msg("Could not bootstrap the base system")
            .run()?;

        // downloaded archives are dead weight in the image
        let archives = self.ctx.target_rootfs.join("var/cache/apt/archives");
        if archives.exists() {
            for entry in fs::read_dir(&archives)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "deb") {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    // The apt configuration lives inside the target itself, so there is no
    // transient copy to maintain and nothing extra to do for persistence.
    fn register_feeds(&mut self, feeds: &[Feed], _persist: bool) -> Result<()> {
        let path = self.ctx.target_rootfs.join("etc/apt/sources.list");
        let base = self.bootstrap.sources.as_deref().unwrap_or("");
        fs::write(&path, assemble_sources(base, feeds))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.write_preferences()
    }

    fn set_exclusions(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            if !self.exclusions.contains(name) {
                self.exclusions.push(name.clone());
            }
        }
        debug!("Exclude packages: {}", self.exclusions.join(" "));
        self.write_preferences()
    }

    fn exclusions(&self) -> &[String] {
        &self.exclusions
    }

    fn refresh_index(&mut self) -> Result<()> {
        self.chroot_apt(&["update".to_string()], false)?;
        Ok(())
    }

    fn install(&mut self, names: &[String], attempt_only: bool) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        debug!("chroot apt install: {} (attempt {attempt_only})", names.join(" "));

        let mut args = vec!["install".to_string()];
        if !self.ctx.install_recommends {
            args.push("--no-install-recommends".to_string());
        }
        for flag in [
            "-y",
            "--allow-downgrades",
            "--allow-remove-essential",
            "--allow-change-held-packages",
            "--allow-unauthenticated",
        ] {
            args.push(flag.to_string());
        }
        args.extend(names.iter().cloned());

        let mut mounts = BindMounts::bind(&self.ctx.target_rootfs)?;
        let result = self.chroot_apt(&args, attempt_only);
        mounts.unmount();

        let result = result?;
        if attempt_only && !result.success() {
            warn!(
                "Best-effort install failed, continuing:\n{}",
                result.stderr_trimmed()
            );
        }
        Ok(())
    }

    fn remove(&mut self, names: &[String], with_dependencies: bool) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        debug!("chroot apt remove: {}", names.join(" "));

        if with_dependencies {
            let mut args = vec!["purge".to_string(), "-y".to_string()];
            args.extend(names.iter().cloned());
            self.chroot_apt(&args, false)?;
        } else {
            let target = &self.ctx.target_rootfs;
            Cmd::new(self.dpkg.to_string_lossy())
                .arg(format!("--admindir={}/var/lib/dpkg", target.display()))
                .arg(format!("--instdir={}", target.display()))
                .args(["-P", "--force-depends"])
                .args(names)
                .error_msg("Could not invoke dpkg")
                .run()?;
        }
        Ok(())
    }

    fn list_installed(&mut self) -> Result<Manifest> {
        query_installed(&self.dpkg_query, &self.ctx.target_rootfs)
    }

    fn run_intercepts(&mut self) -> Result<()> {
        // scriptlets already ran natively inside the chroot
        debug!("No intercepts for the bootstrapped backend");
        Ok(())
    }

    fn handle_intercept_failure(&mut self, packages: &[String]) -> Result<()> {
        mark_packages(&self.ctx.target_rootfs, "unpacked", Some(packages))
    }

    fn post_install(&mut self) -> Result<()> {
        scrub_bootstrap_artifacts(&self.ctx.target_rootfs)
    }
}

fn debootstrap_args(bootstrap: &BootstrapConfig, machine: &str, target_rootfs: &Path) -> Vec<String> {
    vec![
        "--no-check-gpg".to_string(),
        format!("--arch={}", debian_arch_map(machine)),
        format!("--components={}", bootstrap.components.join(",")),
        bootstrap.distro.clone(),
        target_rootfs.to_string_lossy().into_owned(),
        bootstrap.mirror.clone(),
    ]
}

fn assemble_sources(base: &str, feeds: &[Feed]) -> String {
    let mut sources = base.to_string();
    if !sources.is_empty() && !sources.ends_with('\n') {
        sources.push('\n');
    }
    for feed in feeds {
        sources.push_str(&sources_line(feed));
    }
    sources
}

fn assemble_preferences(base: &str, exclusions: &[String]) -> String {
    let mut body = base.to_string();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    if !exclusions.is_empty() {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&exclusion_pins(exclusions));
    }
    body
}

/// Drop host leftovers from the bootstrap and restore the mount point
/// directories the image needs at boot.
fn scrub_bootstrap_artifacts(target_rootfs: &Path) -> Result<()> {
    for rel in BOOTSTRAP_CRUFT {
        let path = target_rootfs.join(rel);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?,
            Ok(_) => fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?,
            Err(_) => continue,
        }
    }
    for rel in ["dev", "proc", "sys"] {
        fs::create_dir_all(target_rootfs.join(rel))?;
    }
    Ok(())
}
