//! Installed-package records and the image manifest.
//!
//! At the end of a build the backend's database is snapshotted into two
//! files under the workdir: `packages.json` (one structured record per
//! package, keyed by name) and `<image>-<machine>.manifest` (plain
//! `name arch version` lines for quick inspection). Both are written once
//! per build and never mutated afterward.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// One installed package as reported by the backend's live database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub arch: String,
    #[serde(rename = "ver")]
    pub version: String,
    /// Name of the package file the install came from.
    pub filename: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provs: Vec<String>,
}

/// Snapshot of every installed package, keyed by package name.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    packages: BTreeMap<String, PackageRecord>,
}

impl Manifest {
    pub fn new<I>(records: I) -> Self
    where
        I: IntoIterator<Item = PackageRecord>,
    {
        let packages = records
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect();
        Self { packages }
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PackageRecord> {
        self.packages.get(name)
    }

    /// Installed package names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &PackageRecord> {
        self.packages.values()
    }

    /// Every virtual name provided by any installed package.
    pub fn provided_names(&self) -> BTreeSet<String> {
        self.records()
            .flat_map(|record| record.provs.iter().cloned())
            .collect()
    }

    /// Plain-text manifest body: `name arch version` per line, sorted,
    /// newline terminated when non-empty.
    pub fn image_manifest_lines(&self) -> String {
        let mut out = String::new();
        for record in self.records() {
            out.push_str(&record.name);
            out.push(' ');
            out.push_str(&record.arch);
            out.push(' ');
            out.push_str(&record.version);
            out.push('\n');
        }
        out
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.packages)
            .context("Failed to serialize package manifest")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let packages: BTreeMap<String, PackageRecord> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;
        Ok(Self { packages })
    }

    pub fn save_image_manifest(&self, path: &Path) -> Result<()> {
        fs::write(path, self.image_manifest_lines())
            .with_context(|| format!("Failed to write image manifest: {}", path.display()))?;
        Ok(())
    }
}
