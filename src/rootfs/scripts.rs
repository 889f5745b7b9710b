//! Pre and post rootfs hook execution.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::process::Cmd;

/// Run one image hook.
///
/// The hook text becomes the body of a generated bash script, so hooks can
/// be whole pipelines rather than a single command. The script sees the
/// build through `IMAGE_ROOTFS` and `MACHINE`, plus `libexecdir` for hooks
/// ported over from recipe environments that expect it.
pub fn run_hook(
    command: &str,
    target_rootfs: &Path,
    machine: &str,
    scratch_dir: &Path,
) -> Result<()> {
    fs::create_dir_all(scratch_dir).with_context(|| {
        format!(
            "Failed to create scratch directory {}",
            scratch_dir.display()
        )
    })?;

    let mut script = tempfile::Builder::new()
        .prefix("hook-")
        .suffix(".sh")
        .tempfile_in(scratch_dir)
        .context("Failed to create hook script")?;
    script.write_all(format!("#!/usr/bin/env bash\n{command}\n").as_bytes())?;
    script.flush()?;

    let mut perms = fs::metadata(script.path())?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(script.path(), perms)?;

    debug!("Running rootfs hook: {command}");
    Cmd::new(script.path().to_string_lossy())
        .env_path("IMAGE_ROOTFS", target_rootfs)
        .env("MACHINE", machine)
        .env("libexecdir", "/usr/libexec")
        .error_msg(format!("Rootfs hook failed: {command}"))
        .run()?;
    Ok(())
}
