//! dnf/rpm backend: installs into an install root on the host.
//!
//! dnf runs outside the target with `--installroot`, so the target never
//! needs to be bootable. rpm is configured through files inside the target
//! (`etc/rpm/platform`, `etc/rpmrc`, `etc/dnf/vars`) to accept the image's
//! package architectures instead of the host's.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::Feed;
use crate::manifest::{Manifest, PackageRecord};
use crate::process::Cmd;

use super::intercept::{finish_intercepts, scriptlet_failure_error, InterceptRunner};
use super::{is_self_referential, BackendContext, PackageBackend};

/// dnf output marker for a postinstall scriptlet that ran and failed.
const POSTIN_ERROR_PREFIX: &str = "Error in POSTIN scriptlet in rpm package";

/// Deferred scriptlets live here in the image, picked up at first boot.
const POSTINSTS_DIR: &str = "etc/rpm-postinsts";

pub struct DnfBackend {
    ctx: BackendContext,
    dnf: PathBuf,
    rpm: PathBuf,
    exclusions: Vec<String>,
    intercepts: InterceptRunner,
}

impl DnfBackend {
    pub fn new(ctx: BackendContext) -> Result<Self> {
        ctx.prepare_dirs()?;
        let dnf = which::which("dnf")
            .context("Could not find 'dnf' in PATH. Install dnf to build rpm images")?;
        let rpm = which::which("rpm")
            .context("Could not find 'rpm' in PATH. Install rpm to build rpm images")?;
        let intercepts = InterceptRunner::initialize(
            &ctx.workdir,
            &ctx.target_rootfs,
            ctx.intercept_source().as_deref(),
        )?;
        Ok(Self {
            ctx,
            dnf,
            rpm,
            exclusions: Vec::new(),
            intercepts,
        })
    }

    fn repos_dir(&self) -> PathBuf {
        self.ctx.temp_dir().join("yum.repos.d")
    }

    /// Environment for any operation that may run package scriptlets.
    fn transaction_env(&self) -> Vec<(String, String)> {
        let mut env = self.ctx.transaction_env(self.intercepts.dir());
        env.push(("RPM_NO_CHROOT_FOR_SCRIPTS".to_string(), "1".to_string()));
        env
    }

    fn invoke_dnf(&self, args: &[String], allow_fail: bool) -> Result<crate::process::CommandResult> {
        let mut cmd = Cmd::new(self.dnf.to_string_lossy())
            .args(standard_dnf_args(&self.ctx))
            .args(args)
            .env_path("RPM_ETCCONFIGDIR", &self.ctx.target_rootfs)
            .envs(self.transaction_env())
            .error_msg("Could not invoke dnf");
        if allow_fail {
            cmd = cmd.allow_fail();
        }
        cmd.run()
    }

    fn save_rpm_postinst(&self, pkg: &str) -> Result<()> {
        debug!("Saving postinstall script of {pkg}");
        let result = Cmd::new(self.rpm.to_string_lossy())
            .arg("-q")
            .arg(format!("--root={}", self.ctx.target_rootfs.display()))
            .args(["--queryformat", "%{postin}"])
            .arg(pkg)
            .error_msg("Could not invoke rpm")
            .run()?;

        let dir = self.ctx.target_rootfs.join(POSTINSTS_DIR);
        fs::create_dir_all(&dir)?;
        let prefix = next_script_prefix(&dir)?;
        let path = dir.join(format!("{prefix}-{pkg}"));
        fs::write(&path, result.stdout)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
        Ok(())
    }

    /// Fold the exclusion list into the image's own dnf.conf so the pins
    /// survive into the deployed system.
    fn set_target_dnf_conf(&self) -> Result<()> {
        if self.exclusions.is_empty() {
            return Ok(());
        }
        let dnf_conf = self.ctx.target_rootfs.join("etc/dnf/dnf.conf");
        if !dnf_conf.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&dnf_conf)?;
        fs::write(
            &dnf_conf,
            fold_exclusions_into_dnf_conf(&content, &self.exclusions),
        )?;
        Ok(())
    }
}

impl PackageBackend for DnfBackend {
    fn configure(&mut self) -> Result<()> {
        let target = &self.ctx.target_rootfs;

        // dnf side: arch priority list and an (initially empty) dnf.conf.
        let vars_dir = target.join("etc/dnf/vars");
        fs::create_dir_all(&vars_dir)?;
        fs::write(
            vars_dir.join("arch"),
            dnf_vars_arch(&self.ctx.package_archs),
        )?;
        fs::write(vars_dir.join("releasever"), "")?;
        let dnf_conf = target.join("etc/dnf/dnf.conf");
        if !dnf_conf.exists() {
            fs::write(&dnf_conf, "")?;
        }

        // rpm side: install architecture and compatibility mapping, without
        // which rpm refuses packages built for the image's architectures.
        let rpm_dir = target.join("etc/rpm");
        fs::create_dir_all(&rpm_dir)?;
        let primary = self.ctx.primary_arch();
        fs::write(rpm_dir.join("platform"), format!("{primary}-pc-linux\n"))?;
        fs::write(
            target.join("etc/rpmrc"),
            rpmrc_content(&primary, &self.ctx.package_archs),
        )?;
        fs::write(rpm_dir.join("macros"), macros_content(&self.ctx.machine))?;
        Ok(())
    }

    fn register_feeds(&mut self, feeds: &[Feed], persist: bool) -> Result<()> {
        let repos_dir = self.repos_dir();
        if repos_dir.exists() {
            fs::remove_dir_all(&repos_dir)?;
        }
        fs::create_dir_all(&repos_dir)?;

        let target_repos_dir = self.ctx.target_rootfs.join("etc/yum.repos.d");
        if persist {
            fs::create_dir_all(&target_repos_dir)?;
        }

        for feed in feeds {
            let file_name = format!("{}.repo", feed.repo_id());
            let body = repo_file_body(feed);

            if persist {
                fs::write(target_repos_dir.join(&file_name), &body)?;
            }

            // A feed pointing at our own output tree would make dnf read the
            // image it is in the middle of writing.
            if is_self_referential(feed, &self.ctx.workdir, &self.ctx.target_rootfs) {
                debug!("Skipping self-referential feed {}", feed.uri);
                continue;
            }
            fs::write(repos_dir.join(&file_name), &body)?;
        }
        Ok(())
    }

    fn set_exclusions(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            if !self.exclusions.contains(name) {
                self.exclusions.push(name.clone());
            }
        }
        debug!("Exclude packages: {}", self.exclusions.join(" "));
        Ok(())
    }

    fn exclusions(&self) -> &[String] {
        &self.exclusions
    }

    fn refresh_index(&mut self) -> Result<()> {
        self.invoke_dnf(&["makecache".to_string(), "--refresh".to_string()], false)?;
        Ok(())
    }

    fn install(&mut self, names: &[String], attempt_only: bool) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        debug!("dnf install: {} (attempt {attempt_only})", names.join(" "));

        let mut args = install_args(
            &self.exclusions,
            attempt_only,
            self.ctx.install_recommends,
        );
        args.extend(names.iter().cloned());

        let result = self.invoke_dnf(&args, attempt_only)?;
        if attempt_only && !result.success() {
            warn!(
                "Best-effort install failed, continuing:\n{}",
                result.stderr_trimmed()
            );
            return Ok(());
        }

        let failed = scan_postin_failures(&result.combined());
        if !failed.is_empty() {
            return Err(scriptlet_failure_error(&failed, &self.ctx.temp_dir()));
        }
        Ok(())
    }

    fn remove(&mut self, names: &[String], with_dependencies: bool) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        debug!("dnf remove: {}", names.join(" "));

        if with_dependencies {
            let mut args = vec!["remove".to_string()];
            args.extend(names.iter().cloned());
            self.invoke_dnf(&args, false)?;
        } else {
            Cmd::new(self.rpm.to_string_lossy())
                .args(["-e", "-v", "--nodeps"])
                .arg(format!("--root={}", self.ctx.target_rootfs.display()))
                .args(names)
                .envs(self.transaction_env())
                .error_msg("Could not invoke rpm")
                .run()?;
        }
        Ok(())
    }

    fn list_installed(&mut self) -> Result<Manifest> {
        let result = self.invoke_dnf(
            &[
                "repoquery".to_string(),
                "--installed".to_string(),
                "--queryformat".to_string(),
                REPOQUERY_FORMAT.to_string(),
            ],
            false,
        )?;
        Ok(Manifest::new(parse_repoquery(&result.stdout)))
    }

    fn run_intercepts(&mut self) -> Result<()> {
        let env = self.transaction_env();
        let outcome = self.intercepts.run(&env)?;
        let log_dir = self.ctx.temp_dir();
        finish_intercepts(self, outcome, &log_dir)
    }

    fn handle_intercept_failure(&mut self, packages: &[String]) -> Result<()> {
        fs::create_dir_all(self.ctx.target_rootfs.join(POSTINSTS_DIR))?;
        for pkg in packages {
            self.save_rpm_postinst(pkg)?;
        }
        Ok(())
    }

    fn post_install(&mut self) -> Result<()> {
        if self.list_installed()?.contains("dnf") {
            self.set_target_dnf_conf()?;
        }
        Ok(())
    }
}

const REPOQUERY_FORMAT: &str = "Package: %{name} %{arch} %{version} \
%{name}-%{version}-%{release}.%{arch}.rpm\n\
Dependencies:\n%{requires}\n\
Recommendations:\n%{recommends}\n\
Provides:\n%{provides}\n\
DependenciesEndHere:\n";

/// Architectures for `etc/dnf/vars/arch`: priority order reversed so the
/// most specific arch comes first. libsolv handles noarch internally.
fn dnf_vars_arch(package_archs: &[String]) -> String {
    let mut archs: Vec<&str> = package_archs
        .iter()
        .rev()
        .map(String::as_str)
        .filter(|arch| !matches!(*arch, "any" | "all" | "noarch"))
        .collect();
    // A single entry would fall back to libsolv's built-in arch policies;
    // the filler keeps the explicit list in charge.
    if archs.len() <= 1 {
        archs.push("bogusarch");
    }
    archs.join(":")
}

fn rpmrc_content(primary_arch: &str, package_archs: &[String]) -> String {
    let compat = if package_archs.is_empty() {
        primary_arch.to_string()
    } else {
        package_archs.join(" ")
    };
    format!(
        "arch_compat: {primary_arch}: {compat}\n\
         buildarch_compat: {primary_arch}: noarch\n"
    )
}

fn macros_content(machine: &str) -> String {
    let mut macros = String::from("%_transaction_color 7\n%_var /var\n");
    if machine == "intel-x86-64" {
        macros.push_str("%_prefer_color 7\n");
    }
    macros
}

fn repo_file_body(feed: &Feed) -> String {
    let id = feed.repo_id();
    format!(
        "[{id}]\nname=Package feed {id}\nbaseurl={}\ngpgcheck=0\n",
        feed.uri
    )
}

fn standard_dnf_args(ctx: &BackendContext) -> Vec<String> {
    vec![
        "-v".to_string(),
        "--rpmverbosity=info".to_string(),
        "-y".to_string(),
        "-c".to_string(),
        ctx.target_rootfs
            .join("etc/dnf/dnf.conf")
            .to_string_lossy()
            .into_owned(),
        format!(
            "--setopt=reposdir={}",
            ctx.temp_dir().join("yum.repos.d").display()
        ),
        "--setopt=keepcache=True".to_string(),
        format!("--setopt=cachedir={}", ctx.workdir.join("dnfcache").display()),
        format!("--installroot={}", ctx.target_rootfs.display()),
        format!("--setopt=logdir={}", ctx.temp_dir().display()),
    ]
}

fn install_args(exclusions: &[String], attempt_only: bool, install_recommends: bool) -> Vec<String> {
    let mut args = Vec::new();
    if attempt_only {
        args.push("--skip-broken".to_string());
    }
    if !exclusions.is_empty() {
        args.push("-x".to_string());
        args.push(exclusions.join(","));
    }
    if !install_recommends {
        args.push("--setopt=install_weak_deps=False".to_string());
    }
    args.push("--nogpgcheck".to_string());
    args.push("install".to_string());
    args
}

/// Names of packages whose POSTIN scriptlet failed, from dnf output,
/// first-seen order without duplicates.
fn scan_postin_failures(output: &str) -> Vec<String> {
    let mut failed = Vec::new();
    for line in output.lines() {
        if line.starts_with(POSTIN_ERROR_PREFIX) {
            if let Some(pkg) = line.split_whitespace().last() {
                if !failed.iter().any(|f| f == pkg) {
                    failed.push(pkg.to_string());
                }
            }
        }
    }
    failed
}

/// Parse `dnf repoquery` output in `REPOQUERY_FORMAT` into records.
fn parse_repoquery(output: &str) -> Vec<PackageRecord> {
    enum Section {
        Initial,
        Dependencies,
        Recommendations,
        Provides,
    }

    let mut records: Vec<PackageRecord> = Vec::new();
    let mut section = Section::Initial;

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("Package:") {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() >= 4 {
                records.push(PackageRecord {
                    name: fields[0].to_string(),
                    arch: fields[1].to_string(),
                    version: fields[2].to_string(),
                    filename: fields[3].to_string(),
                    ..Default::default()
                });
            }
            section = Section::Initial;
        } else if line.starts_with("Dependencies:") {
            section = Section::Dependencies;
        } else if line.starts_with("Recommendations") {
            section = Section::Recommendations;
        } else if line.starts_with("Provides:") {
            section = Section::Provides;
        } else if line.starts_with("DependenciesEndHere:") {
            section = Section::Initial;
        } else if !line.is_empty() {
            if let Some(record) = records.last_mut() {
                match section {
                    Section::Dependencies => record.deps.push(line.to_string()),
                    Section::Recommendations => record.recs.push(line.to_string()),
                    Section::Provides => {
                        // provides carry version qualifiers ("bash = 5.0");
                        // only the name matters for duplicate suppression
                        if let Some(name) = line.split_whitespace().next() {
                            record.provs.push(name.to_string());
                        }
                    }
                    Section::Initial => {}
                }
            }
        }
    }
    records
}

/// Ordering prefix for the next saved scriptlet: one past the highest
/// existing prefix, starting at 100.
fn next_script_prefix(dir: &Path) -> Result<u32> {
    let mut highest = 99;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(prefix) = name.split('-').next() {
                if let Ok(number) = prefix.parse::<u32>() {
                    highest = highest.max(number);
                }
            }
        }
    }
    Ok(highest + 1)
}

/// Merge exclusions into a dnf.conf body, extending any existing
/// `exclude=` entry under `[main]`.
fn fold_exclusions_into_dnf_conf(content: &str, exclusions: &[String]) -> String {
    let addition = exclusions.join(" ");

    if content.trim().is_empty() {
        return format!("[main]\nexclude={addition}\n");
    }

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    if let Some(idx) = lines.iter().position(|l| l.trim_start().starts_with("exclude=")) {
        let existing = lines[idx].trim_start().trim_start_matches("exclude=").trim();
        lines[idx] = if existing.is_empty() {
            format!("exclude={addition}")
        } else {
            format!("exclude={existing} {addition}")
        };
    } else if let Some(idx) = lines.iter().position(|l| l.trim() == "[main]") {
        lines.insert(idx + 1, format!("exclude={addition}"));
    } else {
        lines.push("[main]".to_string());
        lines.push(format!("exclude={addition}"));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dnf_vars_arch_reversed_and_filtered() {
        let archs = vec![
            "noarch".to_string(),
            "core2_64".to_string(),
            "corei7_64".to_string(),
        ];
        assert_eq!(dnf_vars_arch(&archs), "corei7_64:core2_64");
    }

    #[test]
    fn test_dnf_vars_arch_pads_single_entry() {
        let archs = vec!["noarch".to_string(), "core2_64".to_string()];
        assert_eq!(dnf_vars_arch(&archs), "core2_64:bogusarch");
    }

    #[test]
    fn test_rpmrc_lists_compat_archs() {
        let archs = vec!["noarch".to_string(), "core2_64".to_string()];
        let rpmrc = rpmrc_content("intel_x86_64", &archs);
        assert!(rpmrc.contains("arch_compat: intel_x86_64: noarch core2_64"));
        assert!(rpmrc.contains("buildarch_compat: intel_x86_64: noarch"));
    }

    #[test]
    fn test_macros_prefer_color_only_on_intel() {
        assert!(macros_content("intel-x86-64").contains("%_prefer_color 7"));
        assert!(!macros_content("bcm-2xxx-rpi4").contains("%_prefer_color"));
        assert!(macros_content("bcm-2xxx-rpi4").contains("%_transaction_color 7"));
    }

    #[test]
    fn test_install_args_attempt_only() {
        let args = install_args(&["kernel-dbg".to_string()], true, true);
        assert_eq!(
            args,
            vec!["--skip-broken", "-x", "kernel-dbg", "--nogpgcheck", "install"]
        );
    }

    #[test]
    fn test_install_args_without_recommends() {
        let args = install_args(&[], false, false);
        assert_eq!(
            args,
            vec![
                "--setopt=install_weak_deps=False",
                "--nogpgcheck",
                "install"
            ]
        );
    }

    #[test]
    fn test_scan_postin_failures_dedups_in_order() {
        let output = "\
Installing: bash\n\
Error in POSTIN scriptlet in rpm package bash\n\
Installing: zlib\n\
Error in POSTIN scriptlet in rpm package zlib\n\
Error in POSTIN scriptlet in rpm package bash\n";
        assert_eq!(scan_postin_failures(output), vec!["bash", "zlib"]);
    }

    #[test]
    fn test_parse_repoquery_blocks() {
        let output = "\
Package: bash core2_64 5.0 bash-5.0-r0.core2_64.rpm\n\
Dependencies:\n\
glibc\n\
libtinfo.so.6()(64bit)\n\
Recommendations:\n\
bash-completion\n\
Provides:\n\
bash = 5.0-r0\n\
/bin/sh\n\
DependenciesEndHere:\n\
Package: zlib core2_64 1.2.11 zlib-1.2.11-r0.core2_64.rpm\n\
Dependencies:\n\
Recommendations:\n\
Provides:\n\
zlib = 1.2.11-r0\n\
DependenciesEndHere:\n";

        let records = parse_repoquery(output);
        assert_eq!(records.len(), 2);

        let bash = &records[0];
        assert_eq!(bash.name, "bash");
        assert_eq!(bash.arch, "core2_64");
        assert_eq!(bash.version, "5.0");
        assert_eq!(bash.filename, "bash-5.0-r0.core2_64.rpm");
        assert_eq!(bash.deps, vec!["glibc", "libtinfo.so.6()(64bit)"]);
        assert_eq!(bash.recs, vec!["bash-completion"]);
        assert_eq!(bash.provs, vec!["bash", "/bin/sh"]);

        let zlib = &records[1];
        assert!(zlib.deps.is_empty());
        assert_eq!(zlib.provs, vec!["zlib"]);
    }

    #[test]
    fn test_fold_exclusions_creates_main_section() {
        let folded = fold_exclusions_into_dnf_conf("", &["kernel-dbg".to_string()]);
        assert_eq!(folded, "[main]\nexclude=kernel-dbg\n");
    }

    #[test]
    fn test_fold_exclusions_appends_to_existing() {
        let conf = "[main]\ngpgcheck=0\nexclude=old-pkg\n";
        let folded = fold_exclusions_into_dnf_conf(conf, &["kernel-dbg".to_string()]);
        assert!(folded.contains("exclude=old-pkg kernel-dbg"));
        assert!(folded.contains("gpgcheck=0"));
    }

    #[test]
    fn test_fold_exclusions_inserts_into_main() {
        let conf = "[main]\ngpgcheck=0\n";
        let folded = fold_exclusions_into_dnf_conf(conf, &["kernel-dbg".to_string()]);
        assert!(folded.contains("[main]"));
        assert!(folded.contains("exclude=kernel-dbg"));
    }

    #[test]
    fn test_next_script_prefix_starts_at_100() {
        let dir = TempDir::new().unwrap();
        assert_eq!(next_script_prefix(dir.path()).unwrap(), 100);
    }

    #[test]
    fn test_next_script_prefix_past_highest() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("100-bash"), "").unwrap();
        fs::write(dir.path().join("150-zlib"), "").unwrap();
        fs::write(dir.path().join("ignored"), "").unwrap();
        assert_eq!(next_script_prefix(dir.path()).unwrap(), 151);
    }
}
