//! apt/dpkg backend: installs into an install root on the host.
//!
//! apt-get runs against a generated configuration tree under the scratch
//! directory, with every path option pointed into either that tree or the
//! target rootfs. dpkg is driven through `--root`/`--admindir` options in
//! the same configuration, so neither tool ever touches the host's own
//! package database.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::Feed;
use crate::manifest::{Manifest, PackageRecord};
use crate::process::Cmd;

use super::intercept::{
    classify_failure, finish_intercepts, scriptlet_failure_error, InterceptRunner,
    ScriptletFailureKind,
};
use super::{is_self_referential, BackendContext, PackageBackend};

/// Debian architecture for one of our machine names.
pub(super) fn debian_arch_map(machine: &str) -> &str {
    match machine {
        "intel-x86-64" => "amd64",
        "bcm-2xxx-rpi4" => "arm64",
        other => other,
    }
}

pub struct AptBackend {
    ctx: BackendContext,
    apt_get: PathBuf,
    dpkg: PathBuf,
    dpkg_query: PathBuf,
    exclusions: Vec<String>,
    intercepts: InterceptRunner,
}

impl AptBackend {
    pub fn new(ctx: BackendContext) -> Result<Self> {
        ctx.prepare_dirs()?;
        let apt_get = which::which("apt-get")
            .context("Could not find 'apt-get' in PATH. Install apt to build deb images")?;
        let dpkg = which::which("dpkg")
            .context("Could not find 'dpkg' in PATH. Install dpkg to build deb images")?;
        let dpkg_query = which::which("dpkg-query")
            .context("Could not find 'dpkg-query' in PATH. Install dpkg to build deb images")?;
        let intercepts = InterceptRunner::initialize(
            &ctx.workdir,
            &ctx.target_rootfs,
            ctx.intercept_source().as_deref(),
        )?;
        Ok(Self {
            ctx,
            apt_get,
            dpkg,
            dpkg_query,
            exclusions: Vec::new(),
            intercepts,
        })
    }

    fn apt_conf_dir(&self) -> PathBuf {
        self.ctx.temp_dir().join("apt")
    }

    fn apt_conf_file(&self) -> PathBuf {
        self.apt_conf_dir().join("apt.conf")
    }

    fn transaction_env(&self) -> Vec<(String, String)> {
        self.ctx.transaction_env(self.intercepts.dir())
    }

    fn invoke_apt(&self, args: &[String], attempt_only: bool) -> Result<crate::process::CommandResult> {
        let mut cmd = Cmd::new(self.apt_get.to_string_lossy())
            .args(args)
            .env_path("APT_CONFIG", &self.apt_conf_file())
            .envs(self.transaction_env())
            .error_msg("Could not invoke apt-get");
        if attempt_only {
            cmd = cmd.allow_fail();
        }
        cmd.run()
    }

    /// A partially failed transaction leaves half-configured packages
    /// behind; `apt-get -f install` settles them.
    fn fix_broken_dependencies(&self) -> Result<()> {
        debug!("Fixing broken dependencies");
        self.invoke_apt(
            &[
                "--allow-unauthenticated".to_string(),
                "-f".to_string(),
                "install".to_string(),
            ],
            false,
        )?;
        Ok(())
    }

    /// Run each installed package's preinst/postinst control script against
    /// the offline tree.
    ///
    /// Scripts that cannot work without the real target hardware are
    /// deferred by marking their package unpacked, which makes dpkg
    /// configure it again at first boot. Any other failure aborts the
    /// build.
    fn run_pre_post_installs(&mut self) -> Result<()> {
        let status_path = self.ctx.target_rootfs.join("var/lib/dpkg/status");
        let status = fs::read_to_string(&status_path)
            .with_context(|| format!("Failed to read {}", status_path.display()))?;
        let installed = installed_names_from_status(&status);

        let info_dir = self.ctx.target_rootfs.join("var/lib/dpkg/info");
        let env = self.transaction_env();
        let mut deferred: Vec<String> = Vec::new();

        for pkg in &installed {
            for (suffix, action) in [(".preinst", "install"), (".postinst", "configure")] {
                let script = info_dir.join(format!("{pkg}{suffix}"));
                if !script.exists() {
                    continue;
                }
                debug!("Executing {suffix} of {pkg}");
                let result = Cmd::new(script.to_string_lossy())
                    .arg(action)
                    .envs(env.iter().map(|(k, v)| (k, v)))
                    .allow_fail()
                    .run()?;
                if result.success() {
                    continue;
                }

                let output = result.combined();
                match classify_failure(&output) {
                    ScriptletFailureKind::EmulationUnsupported => {
                        warn!("{pkg}{suffix} needs the real target, deferring to first boot");
                        deferred.push(pkg.clone());
                        break;
                    }
                    ScriptletFailureKind::ScriptError => {
                        let log_dir = self.ctx.temp_dir();
                        fs::create_dir_all(&log_dir)?;
                        let log_path = log_dir.join("scriptlet_failures.log");
                        fs::write(&log_path, format!("=== {pkg}{suffix} ===\n{output}\n"))
                            .with_context(|| format!("Failed to write {}", log_path.display()))?;
                        return Err(scriptlet_failure_error(&[pkg.clone()], &log_path));
                    }
                }
            }
        }

        if !deferred.is_empty() {
            mark_packages(&self.ctx.target_rootfs, "unpacked", Some(&deferred))?;
        }
        Ok(())
    }
}

impl PackageBackend for AptBackend {
    fn configure(&mut self) -> Result<()> {
        let conf_dir = self.apt_conf_dir();
        if conf_dir.exists() {
            fs::remove_dir_all(&conf_dir)?;
        }
        fs::create_dir_all(conf_dir.join("lists/partial"))?;
        fs::create_dir_all(conf_dir.join("state"))?;
        fs::create_dir_all(conf_dir.join("apt.conf.d"))?;
        fs::create_dir_all(conf_dir.join("preferences.d"))?;

        fs::write(self.apt_conf_file(), apt_conf_body(&self.ctx, &conf_dir))?;
        fs::write(
            conf_dir.join("preferences"),
            preferences_body(&self.ctx.package_archs, &self.exclusions),
        )?;

        // Seed the dpkg database so the first transaction starts from an
        // empty, consistent state.
        let target = &self.ctx.target_rootfs;
        let dpkg_dir = target.join("var/lib/dpkg");
        fs::create_dir_all(dpkg_dir.join("info"))?;
        fs::create_dir_all(dpkg_dir.join("updates"))?;
        for name in ["status", "available"] {
            let path = dpkg_dir.join(name);
            if !path.exists() {
                fs::write(&path, "")?;
            }
        }
        fs::create_dir_all(target.join("var/cache/apt/archives/partial"))?;
        fs::create_dir_all(target.join("etc/apt"))?;
        Ok(())
    }

    fn register_feeds(&mut self, feeds: &[Feed], persist: bool) -> Result<()> {
        let mut build_sources = String::new();
        let mut target_sources = String::new();

        for feed in feeds {
            let line = sources_line(feed);
            target_sources.push_str(&line);
            if is_self_referential(feed, &self.ctx.workdir, &self.ctx.target_rootfs) {
                debug!("Skipping self-referential feed {}", feed.uri);
                continue;
            }
            build_sources.push_str(&line);
        }

        fs::write(self.apt_conf_dir().join("sources.list"), build_sources)?;
        if persist {
            let sources_path = self.ctx.target_rootfs.join("etc/apt/sources.list");
            fs::write(&sources_path, target_sources)
                .with_context(|| format!("Failed to write {}", sources_path.display()))?;
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
        fs::write(
            self.apt_conf_dir().join("preferences"),
            preferences_body(&self.ctx.package_archs, &self.exclusions),
        )?;
        Ok(())
    }

    fn exclusions(&self) -> &[String] {
        &self.exclusions
    }

    fn refresh_index(&mut self) -> Result<()> {
        self.invoke_apt(&["update".to_string()], false)?;
        Ok(())
    }

    fn install(&mut self, names: &[String], attempt_only: bool) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        debug!("apt install: {} (attempt {attempt_only})", names.join(" "));

        let mut args = vec![
            "install".to_string(),
            "--allow-downgrades".to_string(),
            "--allow-remove-essential".to_string(),
            "--allow-change-held-packages".to_string(),
            "--allow-unauthenticated".to_string(),
            "--no-remove".to_string(),
        ];
        args.extend(names.iter().cloned());

        let result = self.invoke_apt(&args, attempt_only)?;
        if attempt_only && !result.success() {
            warn!(
                "Best-effort install failed, continuing:\n{}",
                result.stderr_trimmed()
            );
        }

        rename_dpkg_new_entries(&self.ctx.target_rootfs)?;
        self.fix_broken_dependencies()
    }

    fn remove(&mut self, names: &[String], with_dependencies: bool) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        debug!("apt remove: {}", names.join(" "));

        if with_dependencies {
            let mut args = vec!["purge".to_string()];
            args.extend(names.iter().cloned());
            self.invoke_apt(&args, false)?;
        } else {
            let target = &self.ctx.target_rootfs;
            Cmd::new(self.dpkg.to_string_lossy())
                .arg(format!("--admindir={}/var/lib/dpkg", target.display()))
                .arg(format!("--instdir={}", target.display()))
                .args(["-P", "--force-depends"])
                .args(names)
                .envs(self.transaction_env())
                .error_msg("Could not invoke dpkg")
                .run()?;
        }
        Ok(())
    }

    fn list_installed(&mut self) -> Result<Manifest> {
        query_installed(&self.dpkg_query, &self.ctx.target_rootfs)
    }

    fn run_intercepts(&mut self) -> Result<()> {
        let env = self.transaction_env();
        let outcome = self.intercepts.run(&env)?;
        let log_dir = self.ctx.temp_dir();
        finish_intercepts(self, outcome, &log_dir)
    }

    fn handle_intercept_failure(&mut self, packages: &[String]) -> Result<()> {
        mark_packages(&self.ctx.target_rootfs, "unpacked", Some(packages))
    }

    fn post_install(&mut self) -> Result<()> {
        mark_packages(&self.ctx.target_rootfs, "installed", None)?;
        self.run_pre_post_installs()
    }
}

fn apt_conf_body(ctx: &BackendContext, conf_dir: &Path) -> String {
    let arch = debian_arch_map(&ctx.machine).replace('_', "-");
    let target = ctx.target_rootfs.display();
    let conf = conf_dir.display();
    let recommends = if ctx.install_recommends {
        "true"
    } else {
        "false"
    };
    format!(
        r#"APT
{{
  Architecture "{arch}";
  Architectures {{"{arch}";}};
  Install-Recommends "{recommends}";
  Immediate-Configure "false";
  Get
  {{
    Assume-Yes "true";
  }};
}};

Dir
{{
  State "{conf}/state/";
  State::lists "{conf}/lists/";
  State::status "{target}/var/lib/dpkg/status";
  Cache "{target}/var/cache/apt/";
  Cache::archives "{target}/var/cache/apt/archives/";
  Etc "{conf}/";
  Etc::SourceList "{conf}/sources.list";
  Etc::Preferences "{conf}/preferences";
  Etc::PreferencesParts "{conf}/preferences.d/";
  Etc::Parts "{conf}/apt.conf.d/";
}};

DPkg
{{
  Options {{"--root={target}";"--admindir={target}/var/lib/dpkg";"--force-all";"--no-debsig";}};
  Path "";
}};
"#
    )
}

/// Arch pins keep apt resolving from our feeds in priority order, then
/// exclusion pins make the listed packages uninstallable.
fn preferences_body(package_archs: &[String], exclusions: &[String]) -> String {
    let mut body = String::new();
    let mut priority = 801;
    for arch in package_archs {
        body.push_str(&format!(
            "Package: *\nPin: release l={arch}\nPin-Priority: {priority}\n\n"
        ));
        priority += 5;
    }
    body.push_str(&exclusion_pins(exclusions));
    body
}

pub(super) fn exclusion_pins(exclusions: &[String]) -> String {
    let mut body = String::new();
    for pkg in exclusions {
        body.push_str(&format!(
            "Package: {pkg}\nPin: release *\nPin-Priority: -1\n\n"
        ));
    }
    body
}

/// One sources.list line. Feeds without suite/component tokens are flat
/// archives and take the `./` directory form.
pub(super) fn sources_line(feed: &Feed) -> String {
    if feed.is_flat() {
        format!("deb [trusted=yes] {} ./\n", feed.uri)
    } else {
        format!("deb [trusted=yes] {} {}\n", feed.uri, feed.extra.join(" "))
    }
}

/// dpkg leaves `*.dpkg-new` files behind when it cannot atomically take
/// over a path in the offline tree. Strip the suffix, children before
/// parents so directory renames do not orphan the entries below them.
fn rename_dpkg_new_entries(root: &Path) -> Result<()> {
    let mut pending: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if let Some(name) = entry.file_name().to_str() {
            if name.contains(".dpkg-new") {
                pending.push(entry.path().to_path_buf());
            }
        }
    }
    pending.sort_by_key(|path| std::cmp::Reverse(path.components().count()));

    for path in &pending {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
        else {
            continue;
        };
        let new_name = name.replace(".dpkg-new", "");
        if new_name.is_empty() {
            continue;
        }
        debug!("Renaming {} to {new_name}", path.display());
        fs::rename(path, parent.join(new_name))
            .with_context(|| format!("Failed to rename {}", path.display()))?;
    }
    Ok(())
}

pub(super) const DPKG_QUERY_FORMAT: &str = "Package: ${Package}\n\
Architecture: ${Architecture}\n\
Version: ${Version}\n\
File: ${Package}_${Version}_${Architecture}.deb\n\
Depends: ${Depends}\n\
Recommends: ${Recommends}\n\
Provides: ${Provides}\n\n";

/// Query the target's dpkg database directly, no apt configuration needed.
pub(super) fn query_installed(dpkg_query: &Path, target_rootfs: &Path) -> Result<Manifest> {
    let result = Cmd::new(dpkg_query.to_string_lossy())
        .arg(format!("--admindir={}/var/lib/dpkg", target_rootfs.display()))
        .arg("-W")
        .arg(format!("-f={DPKG_QUERY_FORMAT}"))
        .error_msg("Could not list installed packages")
        .run()?;
    Ok(Manifest::new(parse_dpkg_query(&result.stdout)))
}

/// Parse `dpkg-query -W` output in `DPKG_QUERY_FORMAT` into records.
/// Stanzas are separated by blank lines.
pub(super) fn parse_dpkg_query(output: &str) -> Vec<PackageRecord> {
    let mut records = Vec::new();
    let mut current = PackageRecord::default();

    for line in output.lines().chain(std::iter::once("")) {
        let line = line.trim_end();
        if line.is_empty() {
            if !current.name.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }

        if let Some(value) = line.strip_prefix("Package: ") {
            current.name = value.to_string();
        } else if let Some(value) = line.strip_prefix("Architecture: ") {
            current.arch = value.to_string();
        } else if let Some(value) = line.strip_prefix("Version: ") {
            current.version = value.to_string();
        } else if let Some(value) = line.strip_prefix("File: ") {
            // basename only, some formats hand back a path
            current.filename = value.rsplit('/').next().unwrap_or(value).to_string();
        } else if let Some(value) = line.strip_prefix("Depends: ") {
            current
                .deps
                .extend(split_relation_list(&strip_version_constraints(value)));
        } else if let Some(value) = line.strip_prefix("Recommends: ") {
            current
                .recs
                .extend(split_relation_list(&strip_version_constraints(value)));
        } else if let Some(value) = line.strip_prefix("Provides: ") {
            current
                .provs
                .extend(split_relation_list(&strip_version_constraints(value)));
        }
    }
    records
}

fn split_relation_list(value: &str) -> Vec<String> {
    value
        .split(", ")
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Remove parenthesized version relations such as `(>= 2.14)` from a
/// dependency field, leaving bare package names.
pub(super) fn strip_version_constraints(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find(" (") {
        out.push_str(&rest[..start]);
        match rest[start..].find(')') {
            Some(end) => rest = &rest[start + end + 1..],
            None => {
                rest = &rest[start..];
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Package names listed in a dpkg status file.
fn installed_names_from_status(status: &str) -> Vec<String> {
    status
        .lines()
        .filter_map(|line| line.strip_prefix("Package: "))
        .map(str::to_string)
        .collect()
}

/// Rewrite the dpkg status file, setting the given status tag on the
/// selected packages (or all of them). Only entries currently `installed`
/// or `unpacked` change.
pub(super) fn mark_packages(
    target_rootfs: &Path,
    status_tag: &str,
    packages: Option<&[String]>,
) -> Result<()> {
    let status_file = target_rootfs.join("var/lib/dpkg/status");
    let content = fs::read_to_string(&status_file)
        .with_context(|| format!("Failed to read {}", status_file.display()))?;

    let tmp = status_file.with_extension("tmp");
    fs::write(&tmp, mark_packages_in_status(&content, status_tag, packages))?;
    fs::rename(&tmp, &status_file)
        .with_context(|| format!("Failed to replace {}", status_file.display()))?;
    Ok(())
}

fn mark_packages_in_status(content: &str, status_tag: &str, packages: Option<&[String]>) -> String {
    let mut out_lines: Vec<String> = Vec::with_capacity(content.lines().count());
    let mut selected = packages.is_none();

    for line in content.lines() {
        if let Some(name) = line.strip_prefix("Package: ") {
            selected = match packages {
                None => true,
                Some(list) => list.iter().any(|pkg| pkg == name),
            };
            out_lines.push(line.to_string());
        } else if selected && line.starts_with("Status: ") {
            let mut words: Vec<&str> = line.split_whitespace().collect();
            if matches!(words.last(), Some(&"unpacked") | Some(&"installed")) {
                let last = words.len() - 1;
                words[last] = status_tag;
                out_lines.push(words.join(" "));
            } else {
                out_lines.push(line.to_string());
            }
        } else {
            out_lines.push(line.to_string());
        }
    }

    let mut out = out_lines.join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_debian_arch_map() {
        assert_eq!(debian_arch_map("intel-x86-64"), "amd64");
        assert_eq!(debian_arch_map("bcm-2xxx-rpi4"), "arm64");
        assert_eq!(debian_arch_map("riscv64"), "riscv64");
    }

    #[test]
    fn test_preferences_arch_priorities_step_by_five() {
        let archs = vec!["all".to_string(), "amd64".to_string()];
        let body = preferences_body(&archs, &[]);
        assert!(body.contains("Pin: release l=all\nPin-Priority: 801\n"));
        assert!(body.contains("Pin: release l=amd64\nPin-Priority: 806\n"));
    }

    #[test]
    fn test_preferences_exclusion_pins() {
        let body = preferences_body(&[], &["kernel-dbg".to_string()]);
        assert!(body.contains("Package: kernel-dbg\nPin: release *\nPin-Priority: -1\n"));
    }

    #[test]
    fn test_sources_line_flat_and_suite() {
        let flat = Feed::parse("http://example.com/deb").unwrap();
        assert_eq!(
            sources_line(&flat),
            "deb [trusted=yes] http://example.com/deb ./\n"
        );

        let suite = Feed::parse("http://deb.debian.org/debian bullseye main contrib").unwrap();
        assert_eq!(
            sources_line(&suite),
            "deb [trusted=yes] http://deb.debian.org/debian bullseye main contrib\n"
        );
    }

    #[test]
    fn test_strip_version_constraints() {
        assert_eq!(
            strip_version_constraints("libc6 (>= 2.14), debconf (>= 0.5) | debconf-2.0"),
            "libc6, debconf | debconf-2.0"
        );
        assert_eq!(strip_version_constraints("plain"), "plain");
    }

    #[test]
    fn test_parse_dpkg_query_stanzas() {
        let output = "\
Package: bash\n\
Architecture: amd64\n\
Version: 5.1-2\n\
File: bash_5.1-2_amd64.deb\n\
Depends: base-files (>= 2.1.12), debianutils (>= 2.15)\n\
Recommends: \n\
Provides: \n\
\n\
Package: dash\n\
Architecture: amd64\n\
Version: 0.5.11\n\
File: dash_0.5.11_amd64.deb\n\
Depends: debconf (>= 0.5) | debconf-2.0\n\
Recommends: shells\n\
Provides: sh\n\
\n";

        let records = parse_dpkg_query(output);
        assert_eq!(records.len(), 2);

        let bash = &records[0];
        assert_eq!(bash.name, "bash");
        assert_eq!(bash.version, "5.1-2");
        assert_eq!(bash.deps, vec!["base-files", "debianutils"]);
        assert!(bash.recs.is_empty());

        let dash = &records[1];
        assert_eq!(dash.deps, vec!["debconf | debconf-2.0"]);
        assert_eq!(dash.recs, vec!["shells"]);
        assert_eq!(dash.provs, vec!["sh"]);
    }

    #[test]
    fn test_parse_dpkg_query_strips_filename_path() {
        let output = "\
Package: bash\n\
Architecture: amd64\n\
Version: 5.1-2\n\
File: pool/main/b/bash_5.1-2_amd64.deb\n\
\n";
        let records = parse_dpkg_query(output);
        assert_eq!(records[0].filename, "bash_5.1-2_amd64.deb");
    }

    #[test]
    fn test_installed_names_from_status() {
        let status = "Package: bash\nStatus: install ok installed\n\nPackage: dash\n";
        assert_eq!(installed_names_from_status(status), vec!["bash", "dash"]);
    }

    #[test]
    fn test_mark_all_packages() {
        let status = "\
Package: bash\n\
Status: install ok unpacked\n\
\n\
Package: dash\n\
Status: install ok installed\n";
        let marked = mark_packages_in_status(status, "installed", None);
        assert!(marked.contains("Package: bash\nStatus: install ok installed"));
        assert!(marked.contains("Package: dash\nStatus: install ok installed"));
    }

    #[test]
    fn test_mark_selected_packages_only() {
        let status = "\
Package: bash\n\
Status: install ok installed\n\
\n\
Package: dash\n\
Status: install ok installed\n";
        let marked =
            mark_packages_in_status(status, "unpacked", Some(&["dash".to_string()]));
        assert!(marked.contains("Package: bash\nStatus: install ok installed"));
        assert!(marked.contains("Package: dash\nStatus: install ok unpacked"));
    }

    #[test]
    fn test_mark_leaves_other_states_alone() {
        let status = "Package: broken\nStatus: install ok half-installed\n";
        let marked = mark_packages_in_status(status, "installed", None);
        assert!(marked.contains("half-installed"));
    }

    #[test]
    fn test_apt_conf_points_into_our_trees() {
        let ctx = BackendContext {
            workdir: PathBuf::from("/work"),
            target_rootfs: PathBuf::from("/work/rootfs"),
            machine: "intel-x86-64".to_string(),
            package_archs: vec!["amd64".to_string()],
            install_recommends: false,
            native_root: None,
            data_dir: None,
        };
        let body = apt_conf_body(&ctx, Path::new("/work/temp/apt"));
        assert!(body.contains("Architecture \"amd64\";"));
        assert!(body.contains("Install-Recommends \"false\";"));
        assert!(body.contains("Assume-Yes \"true\";"));
        assert!(body.contains("State::status \"/work/rootfs/var/lib/dpkg/status\";"));
        assert!(body.contains("\"--root=/work/rootfs\";"));
        assert!(body.contains("Etc::SourceList \"/work/temp/apt/sources.list\";"));
    }

    #[test]
    fn test_rename_dpkg_new_entries() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("etc.dpkg-new");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("conf.dpkg-new"), "x").unwrap();
        fs::write(root.path().join("plain"), "y").unwrap();

        rename_dpkg_new_entries(root.path()).unwrap();

        assert!(root.path().join("etc").join("conf").exists());
        assert!(root.path().join("plain").exists());
        assert!(!dir.exists());
    }
}
