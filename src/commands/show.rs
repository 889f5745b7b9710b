//! Show command - displays information.

use std::path::Path;

use anyhow::{bail, Result};

use crate::config::BuildConfig;
use crate::manifest::Manifest;

/// Show target for the show command.
pub enum ShowTarget {
    /// Merged configuration
    Config,
    /// Manifest of the last build
    Manifest,
}

/// Execute the show command.
pub fn cmd_show(config_path: &Path, target: ShowTarget) -> Result<()> {
    let config = BuildConfig::load(config_path)?;

    match target {
        ShowTarget::Config => {
            config.print();
        }
        ShowTarget::Manifest => {
            let path = config.workdir.join("packages.json");
            if !path.exists() {
                bail!(
                    "No manifest at {}. Run 'rootstrap build' first.",
                    path.display()
                );
            }
            let manifest = Manifest::load_json(&path)?;
            println!("{} packages installed:", manifest.len());
            print!("{}", manifest.image_manifest_lines());
        }
    }
    Ok(())
}
