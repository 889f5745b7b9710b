//! Build command - assembles the root filesystem.

use std::path::Path;
use std::time::Instant;

use anyhow::Result;

use crate::config::BuildConfig;
use crate::fakeroot::FakerootEnv;
use crate::preflight;
use crate::rootfs::{self, RootfsBuilder};

/// Execute the build command.
pub fn cmd_build(config_path: &Path, no_clean: bool, skip_preflight: bool) -> Result<()> {
    let mut config = BuildConfig::load(config_path)?;
    if no_clean {
        config.no_clean = true;
    }
    config.print();
    println!();

    if skip_preflight {
        println!("Skipping preflight checks.");
    } else {
        preflight::run_preflight_or_fail(&config)?;
    }

    let start = Instant::now();

    rootfs::prepare_workspace(&config)?;

    // Real root is required (and checked) for the external backend; everyone
    // else gets file ownership emulated through pseudo.
    let mut fake_root = None;
    if !config.backend.requires_root() {
        fake_root = Some(FakerootEnv::enter(
            &config.workdir,
            &config.target_rootfs,
            config.native_root.as_deref(),
        )?);
    }

    let mut builder = RootfsBuilder::new(config)?;
    let result = builder.create();

    if let Some(env) = fake_root.as_mut() {
        env.exit();
    }
    result?;

    println!("\nBuild finished in {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}
