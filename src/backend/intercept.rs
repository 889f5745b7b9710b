//! Postinstall intercept execution and failure triage.
//!
//! Intercept scripts batch up work that package scriptlets cannot do
//! directly during image assembly (icon caches, font caches, module
//! indexes). Each build gets its own copy of the scripts, in a directory
//! keyed by a hash of the target path so concurrent builds never share
//! state.
//!
//! Failure triage is deliberately asymmetric: a script that could not run
//! at all because the emulation environment lacks the needed machinery is
//! deferred to first boot, while a script that ran and returned non-zero
//! aborts the build naming every affected package. Deferral is never
//! silently chosen for a real failure.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::process::Cmd;

use super::PackageBackend;

/// Scripts with this name prefix are never run during assembly; their
/// registered packages go straight to the deferral path.
const DELAY_PREFIX: &str = "delay_to_first_boot";

/// Helper sourced by the other intercepts, not runnable on its own.
const HELPER_NAME: &str = "postinst_intercept";

/// Output signatures meaning the tool could not execute under emulation,
/// as opposed to the scriptlet itself failing.
const EMULATION_FAILURE_SIGNATURES: &[&str] =
    &["qemuwrapper: qemu usermode is not supported"];

/// How a failing intercept is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptletFailureKind {
    /// The emulation environment cannot run this, defer to first boot.
    EmulationUnsupported,
    /// The script ran and genuinely failed, fatal.
    ScriptError,
}

pub fn classify_failure(output: &str) -> ScriptletFailureKind {
    if EMULATION_FAILURE_SIGNATURES
        .iter()
        .any(|sig| output.contains(sig))
    {
        ScriptletFailureKind::EmulationUnsupported
    } else {
        ScriptletFailureKind::ScriptError
    }
}

/// A genuinely failed intercept script.
#[derive(Debug, Clone)]
pub struct InterceptFailure {
    pub script: String,
    pub packages: Vec<String>,
    pub output: String,
}

/// Result of one intercept sweep.
#[derive(Debug, Clone, Default)]
pub struct InterceptOutcome {
    /// Packages whose postinstalls move to first boot.
    pub deferred: Vec<String>,
    /// Genuine failures, fatal after the sweep completes.
    pub failures: Vec<InterceptFailure>,
}

/// Parse the `##PKGS:` registration line of an intercept script.
pub fn registered_packages(script: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(script)
        .with_context(|| format!("Failed to read intercept script: {}", script.display()))?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("##PKGS:") {
            return Ok(rest.split_whitespace().map(str::to_string).collect());
        }
    }
    Ok(Vec::new())
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Per-build intercept script directory.
pub struct InterceptRunner {
    dir: PathBuf,
}

impl InterceptRunner {
    /// Wipe and repopulate the per-target script directory from `source`.
    ///
    /// More than one build may run on the host at the same time, hence the
    /// hash suffix isolating the directories from each other.
    pub fn initialize(
        workdir: &Path,
        target_rootfs: &Path,
        source: Option<&Path>,
    ) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(target_rootfs.to_string_lossy().as_bytes());
        let dir = workdir.join(format!("intercept_scripts-{:x}", hasher.finalize()));

        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to clear intercept dir: {}", dir.display()))?;
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create intercept dir: {}", dir.display()))?;

        if let Some(source) = source {
            if source.is_dir() {
                for entry in fs::read_dir(source)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        fs::copy(entry.path(), dir.join(entry.file_name())).with_context(
                            || format!("Failed to copy intercept {:?}", entry.file_name()),
                        )?;
                    }
                }
            }
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Execute every runnable intercept with the given environment.
    ///
    /// Scripts run sorted by name. The sweep always completes; failures are
    /// collected into the outcome rather than cutting the run short.
    pub fn run(&self, env: &[(String, String)]) -> Result<InterceptOutcome> {
        let mut outcome = InterceptOutcome::default();

        let mut scripts: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read intercept dir: {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        scripts.sort();

        for script in scripts {
            let name = match script.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            if name == HELPER_NAME || !is_executable(&script) {
                continue;
            }

            if name.starts_with(DELAY_PREFIX) {
                let packages = registered_packages(&script)?;
                if !packages.is_empty() {
                    debug!(
                        "Postponing postinstalls to first boot: {}",
                        packages.join(" ")
                    );
                    outcome.deferred.extend(packages);
                }
                continue;
            }

            debug!("Executing {name} intercept");
            let result = Cmd::new(script.to_string_lossy())
                .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .allow_fail()
                .run()?;

            if result.success() {
                continue;
            }

            let output = result.combined();
            match classify_failure(&output) {
                ScriptletFailureKind::EmulationUnsupported => {
                    debug!(
                        "Intercept '{name}' could not run without qemu usermode support, \
                         deferring to first boot"
                    );
                    let packages = registered_packages(&script)?;
                    if !packages.is_empty() {
                        outcome.deferred.extend(packages);
                    }
                }
                ScriptletFailureKind::ScriptError => {
                    let packages = registered_packages(&script)?;
                    outcome.failures.push(InterceptFailure {
                        script: name,
                        packages,
                        output,
                    });
                }
            }
        }

        Ok(outcome)
    }
}

/// Apply the triage outcome: record deferrals with the backend, then abort
/// if anything genuinely failed.
pub fn finish_intercepts<B>(backend: &mut B, outcome: InterceptOutcome, log_dir: &Path) -> Result<()>
where
    B: PackageBackend + ?Sized,
{
    if !outcome.deferred.is_empty() {
        backend.handle_intercept_failure(&outcome.deferred)?;
    }

    if outcome.failures.is_empty() {
        return Ok(());
    }

    fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("intercept_failures.log");
    let mut log = String::new();
    let mut names = Vec::new();
    for failure in &outcome.failures {
        log.push_str(&format!("=== {} ===\n{}\n", failure.script, failure.output));
        if failure.packages.is_empty() {
            names.push(failure.script.clone());
        } else {
            names.extend(failure.packages.iter().cloned());
        }
    }
    fs::write(&log_path, log)
        .with_context(|| format!("Failed to write {}", log_path.display()))?;

    Err(scriptlet_failure_error(&names, &log_path))
}

/// The uniform abort for scriptlets that ran and genuinely failed.
pub fn scriptlet_failure_error(packages: &[String], log_path: &Path) -> anyhow::Error {
    anyhow::anyhow!(
        "Postinstall scriptlets of {} have failed.\n\
         Deferring to first boot via 'exit 1' is not supported.\n\
         Details of the failure are in {}.",
        packages.join(" "),
        log_path.display()
    )
}
