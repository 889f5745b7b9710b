//! Preflight command - runs host checks.

use std::path::Path;

use anyhow::Result;

use crate::config::BuildConfig;
use crate::preflight;

/// Execute the preflight command.
pub fn cmd_preflight(config_path: &Path, strict: bool) -> Result<()> {
    let config = BuildConfig::load(config_path)?;

    if strict {
        preflight::run_preflight_or_fail(&config)?;
    } else {
        let report = preflight::run_preflight(&config);
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to turn failures into an error.");
        }
    }
    Ok(())
}
