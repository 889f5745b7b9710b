//! Clean command - removes build artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::BuildConfig;
use crate::fakeroot;

/// Clean target for the clean command.
pub enum CleanTarget {
    /// Generated rootfs and fake root state (default)
    Rootfs,
    /// Backend scratch state (feed registry, intercepts, logs)
    Temp,
    /// The whole work directory
    All,
}

/// Execute the clean command.
pub fn cmd_clean(config_path: &Path, target: CleanTarget) -> Result<()> {
    let config = BuildConfig::load(config_path)?;

    match target {
        CleanTarget::Rootfs => {
            remove_dir(&config.target_rootfs)?;
            remove_dir(&fakeroot::state_dir(
                &config.workdir,
                &config.target_rootfs,
            ))?;
            println!("Rootfs cleaned.");
        }
        CleanTarget::Temp => {
            remove_dir(&config.workdir.join("temp"))?;
            for dir in intercept_dirs(&config.workdir)? {
                remove_dir(&dir)?;
            }
            println!("Scratch state cleaned.");
        }
        CleanTarget::All => {
            remove_dir(&config.workdir)?;
            println!("Work directory cleaned.");
        }
    }
    Ok(())
}

fn remove_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        println!("Removing {}...", dir.display());
        fs::remove_dir_all(dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}

/// Per-target intercept script copies living directly under the workdir.
fn intercept_dirs(workdir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !workdir.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(workdir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with("intercept_scripts-")
        {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}
