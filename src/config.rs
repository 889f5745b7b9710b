//! Build configuration loading and merging.
//!
//! The image description is a TOML file; a handful of knobs can be
//! overridden from the environment (loaded via .env in main). Merging
//! happens exactly once: `BuildConfig::load` produces an immutable value
//! object and nothing mutates configuration after that point. Environment
//! variables reappear only at the subprocess boundary.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::BackendKind;

/// Package name excluded from every image. Debug kernels are huge and
/// never belong in a generated rootfs.
const ALWAYS_EXCLUDED: &str = "kernel-dbg";

fn default_true() -> bool {
    true
}

/// On-disk configuration file shape. Field names match the file keys.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    machine: String,
    backend: String,
    #[serde(default)]
    image_name: Option<String>,
    #[serde(default)]
    workdir: Option<PathBuf>,
    #[serde(default)]
    target_rootfs: Option<PathBuf>,
    #[serde(default)]
    package_archs: Vec<String>,
    #[serde(default)]
    package_feeds: Vec<String>,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    external_packages: Vec<String>,
    #[serde(default)]
    exclude_packages: Vec<String>,
    #[serde(default)]
    pkg_globs: Option<String>,
    #[serde(default)]
    image_linguas: Option<String>,
    #[serde(default = "default_true")]
    install_recommends: bool,
    #[serde(default)]
    no_clean: bool,
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    native_root: Option<PathBuf>,
    #[serde(default)]
    rootfs_pre_scripts: Vec<String>,
    #[serde(default)]
    rootfs_post_scripts: Vec<String>,
    #[serde(default)]
    bootstrap: Option<RawBootstrap>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBootstrap {
    mirror: String,
    distro: String,
    #[serde(default)]
    components: Vec<String>,
    #[serde(default)]
    sources: Option<String>,
    #[serde(default)]
    preferences: Option<String>,
}

/// One package feed entry.
///
/// Parsed from a whitespace-separated config string: the first token is the
/// URI, any remaining tokens are backend-specific (for Debian feeds, the
/// suite followed by components). Feed order defines priority layering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub uri: String,
    pub extra: Vec<String>,
}

impl Feed {
    pub fn parse(entry: &str) -> Result<Self> {
        let mut tokens = entry.split_whitespace().map(str::to_string);
        let uri = match tokens.next() {
            Some(uri) => uri,
            None => bail!("Empty package feed entry"),
        };
        Ok(Self {
            uri,
            extra: tokens.collect(),
        })
    }

    /// A flat feed carries no suite/component tokens.
    pub fn is_flat(&self) -> bool {
        self.extra.is_empty()
    }

    /// Stable identifier derived from the URI path, usable as a repo file
    /// name and section header.
    pub fn repo_id(&self) -> String {
        let path = match self.uri.find("://") {
            Some(idx) => {
                let rest = &self.uri[idx + 3..];
                match rest.find('/') {
                    Some(slash) => &rest[slash..],
                    None => "",
                }
            }
            None => self.uri.as_str(),
        };

        let mut id = String::from("rootstrap-repo");
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            id.push('-');
            id.push_str(segment);
        }
        id
    }
}

/// The three package lists of an image description.
///
/// `packages` and `external` should be disjoint; overlaps are detected and
/// warned about during the build, never rejected. `excluded` names are
/// removed from both request lists here and additionally pinned out at the
/// backend so dependency resolution cannot pull them back in.
#[derive(Debug, Clone, Default)]
pub struct PackageSelection {
    pub packages: Vec<String>,
    pub external: Vec<String>,
    pub excluded: Vec<String>,
}

impl PackageSelection {
    fn merge(
        mut packages: Vec<String>,
        external: Vec<String>,
        exclude: Vec<String>,
        linguas: Option<&str>,
    ) -> Self {
        if let Some(linguas) = linguas {
            let locale_pkgs: Vec<String> = linguas
                .split_whitespace()
                .map(|l| format!("locale-base-{l}"))
                .collect();
            let mut merged = locale_pkgs;
            merged.append(&mut packages);
            packages = merged;
        }

        // Dedup exclusions, preserving first-seen order.
        let mut excluded = Vec::new();
        let mut seen = BTreeSet::new();
        for name in exclude.into_iter().chain([ALWAYS_EXCLUDED.to_string()]) {
            if seen.insert(name.clone()) {
                excluded.push(name);
            }
        }

        let is_excluded = |name: &String| excluded.iter().any(|e| e == name);
        packages.retain(|p| !is_excluded(p));
        let mut external = external;
        external.retain(|p| !is_excluded(p));

        Self {
            packages,
            external,
            excluded,
        }
    }

    /// True when the selection installs the backend's own package manager,
    /// in which case feeds are persisted into the image for later use.
    pub fn installs_package_manager(&self) -> bool {
        self.packages
            .iter()
            .chain(self.external.iter())
            .any(|p| p == "dnf" || p == "apt")
    }
}

/// debootstrap settings for the external Debian backend.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub mirror: String,
    pub distro: String,
    pub components: Vec<String>,
    /// apt sources body written into the bootstrapped target. Defaults to a
    /// sources.list generated from the package feeds.
    pub sources: Option<String>,
    /// apt preferences body written into the bootstrapped target.
    pub preferences: Option<String>,
}

impl BootstrapConfig {
    /// Fall back to the first feed carrying suite/component tokens, the way
    /// a plain Debian feed entry already spells mirror, distro and
    /// components.
    fn derive(feeds: &[Feed]) -> Option<Self> {
        let feed = feeds.iter().find(|f| !f.extra.is_empty())?;
        Some(Self {
            mirror: feed.uri.clone(),
            distro: feed.extra[0].clone(),
            components: if feed.extra.len() > 1 {
                feed.extra[1..].to_vec()
            } else {
                vec!["main".to_string()]
            },
            sources: None,
            preferences: None,
        })
    }
}

/// Fully merged, validated build configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub machine: String,
    pub image_name: String,
    pub backend: BackendKind,
    pub workdir: PathBuf,
    pub target_rootfs: PathBuf,
    /// Package architectures in priority order, lowest first.
    pub package_archs: Vec<String>,
    pub feeds: Vec<Feed>,
    pub selection: PackageSelection,
    /// Complementary package globs, e.g. `*-dev`.
    pub pkg_globs: Vec<String>,
    pub install_recommends: bool,
    pub no_clean: bool,
    /// Directory holding postinstall intercept scripts.
    pub data_dir: Option<PathBuf>,
    /// Native tool sysroot, searched for the pseudo library.
    pub native_root: Option<PathBuf>,
    pub rootfs_pre_scripts: Vec<String>,
    pub rootfs_post_scripts: Vec<String>,
    pub bootstrap: Option<BootstrapConfig>,
}

impl BuildConfig {
    /// Load a TOML image description and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Self::merge(raw)
    }

    fn merge(raw: RawConfig) -> Result<Self> {
        if raw.machine.trim().is_empty() {
            bail!("Config field 'machine' must not be empty");
        }

        let backend: BackendKind = raw.backend.parse()?;

        let mut feeds = Vec::new();
        for entry in &raw.package_feeds {
            feeds.push(Feed::parse(entry)?);
        }

        let workdir = env_path("ROOTSTRAP_WORKDIR")
            .or(raw.workdir)
            .unwrap_or_else(|| default_workdir(&raw.machine));
        let target_rootfs = env_path("ROOTSTRAP_TARGET_ROOTFS")
            .or(raw.target_rootfs)
            .unwrap_or_else(|| workdir.join("rootfs"));

        let native_root = env_path("ROOTSTRAP_NATIVE_ROOT").or(raw.native_root);

        let no_clean = env_flag("ROOTSTRAP_NO_CLEAN").unwrap_or(raw.no_clean);
        // NO_RECOMMENDATIONS=1 is the historical switch for skipping weak
        // dependencies; it beats the file either way.
        let install_recommends = match env_flag("NO_RECOMMENDATIONS") {
            Some(set) => !set,
            None => raw.install_recommends,
        };

        let package_archs = if raw.package_archs.is_empty() {
            vec![raw.machine.replace('-', "_")]
        } else {
            raw.package_archs
        };

        let selection = PackageSelection::merge(
            raw.packages,
            raw.external_packages,
            raw.exclude_packages,
            raw.image_linguas.as_deref(),
        );

        let mut pkg_globs = normalize_globs(raw.pkg_globs.as_deref().unwrap_or(""));
        if let Some(linguas) = raw.image_linguas.as_deref() {
            pkg_globs.extend(linguas_globs(linguas));
        }

        let bootstrap = match raw.bootstrap {
            Some(b) => Some(BootstrapConfig {
                mirror: b.mirror,
                distro: b.distro,
                components: if b.components.is_empty() {
                    vec!["main".to_string()]
                } else {
                    b.components
                },
                sources: b.sources,
                preferences: b.preferences,
            }),
            None => BootstrapConfig::derive(&feeds),
        };

        if backend == BackendKind::ExternalDebian && bootstrap.is_none() {
            bail!(
                "The external-debian backend needs a [bootstrap] section \
                 or a package feed with suite and components"
            );
        }
        if backend != BackendKind::ExternalDebian && feeds.is_empty() {
            bail!("At least one entry in 'package_feeds' is required");
        }

        let image_name = raw
            .image_name
            .unwrap_or_else(|| "rootstrap-image".to_string());

        Ok(Self {
            machine: raw.machine,
            image_name,
            backend,
            workdir,
            target_rootfs,
            package_archs,
            feeds,
            selection,
            pkg_globs,
            install_recommends,
            no_clean,
            data_dir: raw.data_dir,
            native_root,
            rootfs_pre_scripts: raw.rootfs_pre_scripts,
            rootfs_post_scripts: raw.rootfs_post_scripts,
            bootstrap,
        })
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  MACHINE: {}", self.machine);
        println!("  IMAGE: {}", self.image_name);
        println!("  BACKEND: {}", self.backend);
        println!("  WORKDIR: {}", self.workdir.display());
        println!("  TARGET_ROOTFS: {}", self.target_rootfs.display());
        println!("  PACKAGE_ARCHS: {}", self.package_archs.join(" "));
        println!("  FEEDS:");
        for feed in &self.feeds {
            if feed.is_flat() {
                println!("    {}", feed.uri);
            } else {
                println!("    {} {}", feed.uri, feed.extra.join(" "));
            }
        }
        println!("  PACKAGES: {}", self.selection.packages.len());
        println!("  EXTERNAL: {}", self.selection.external.len());
        println!("  EXCLUDED: {}", self.selection.excluded.join(" "));
        println!("  PKG_GLOBS: {}", self.pkg_globs.join(" "));
        println!("  INSTALL_RECOMMENDS: {}", self.install_recommends);
    }
}

fn default_workdir(machine: &str) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rootstrap")
        .join(machine)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).map(PathBuf::from)
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    Some(value == "1" || value.eq_ignore_ascii_case("true"))
}

/// Normalize a glob list: `'*-dbg, *-dev'` becomes `['*-dbg', '*-dev']`.
fn normalize_globs(globs: &str) -> Vec<String> {
    globs
        .replace(' ', "")
        .replace(',', " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Locale globs for a language list: each language plus its stem, sorted.
/// `"en-us en-gb"` yields globs for `en`, `en-gb` and `en-us`.
fn linguas_globs(linguas: &str) -> Vec<String> {
    let mut langs = BTreeSet::new();
    for translation in linguas.split_whitespace() {
        langs.insert(translation.to_string());
        if let Some(stem) = translation.split('-').next() {
            langs.insert(stem.to_string());
        }
    }
    langs
        .into_iter()
        .map(|lang| format!("*-locale-{lang}"))
        .collect()
}
