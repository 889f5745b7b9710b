//! Fake root privilege scope for unprivileged installs.
//!
//! Package tools must be able to create files owned by arbitrary uids and
//! device nodes inside the target tree. When the build runs as a normal
//! user this is done through pseudo: an LD_PRELOAD library that intercepts
//! file-metadata syscalls of every descendant process and records ownership
//! in its own database. `FakerootEnv` sets that environment on enter and
//! restores the previous environment on drop, on every exit path; a cleanup
//! registration covers signal-time teardown so interception state never
//! leaks into unrelated processes.
//!
//! Each build keys its pseudo database by a hash of the target path, so
//! concurrent builds on the same host never share interception state.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::cleanup;

/// Relative locations of the interception library under a prefix.
const LIB_SUBPATHS: &[&str] = &[
    "lib/pseudo/lib64/libpseudo.so",
    "lib/pseudo/lib/libpseudo.so",
    "lib64/pseudo/libpseudo.so",
];

/// Pseudo database directory for a given target, inside the workdir.
pub fn state_dir(workdir: &Path, target_rootfs: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(target_rootfs.to_string_lossy().as_bytes());
    workdir.join(format!("pseudo-{:x}", hasher.finalize()))
}

/// Probe for the pseudo library without entering the environment.
pub fn libpseudo_available(native_root: Option<&Path>) -> Option<PathBuf> {
    locate_libpseudo(native_root).map(|(_, lib)| lib)
}

fn locate_libpseudo(native_root: Option<&Path>) -> Option<(PathBuf, PathBuf)> {
    let mut prefixes: Vec<PathBuf> = Vec::new();
    if let Some(prefix) = std::env::var_os("PSEUDO_PREFIX") {
        prefixes.push(PathBuf::from(prefix));
    }
    if let Some(root) = native_root {
        prefixes.push(root.join("usr"));
    }
    prefixes.push(PathBuf::from("/usr"));
    prefixes.push(PathBuf::from("/usr/local"));

    for prefix in prefixes {
        for sub in LIB_SUBPATHS {
            let lib = prefix.join(sub);
            if lib.is_file() {
                return Some((prefix, lib));
            }
        }
    }
    None
}

fn restore_env(saved: &[(String, Option<String>)]) {
    for (key, previous) in saved {
        match previous {
            Some(value) => std::env::set_var(key, value),
            None => std::env::remove_var(key),
        }
    }
}

/// Saves current values, applies new ones, restores on `restore()`.
struct EnvScope {
    saved: Vec<(String, Option<String>)>,
}

impl EnvScope {
    fn apply(vars: &[(String, String)]) -> Self {
        let saved = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                std::env::set_var(key, value);
                (key.clone(), previous)
            })
            .collect();
        Self { saved }
    }

    fn restore(&self) {
        restore_env(&self.saved);
    }
}

/// Scope guard for the fake root environment.
///
/// A no-op when the process already runs as real root.
pub struct FakerootEnv {
    scope: Option<EnvScope>,
    cleanup_id: Option<cleanup::CleanupId>,
}

impl FakerootEnv {
    pub fn enter(workdir: &Path, target_rootfs: &Path, native_root: Option<&Path>) -> Result<Self> {
        if unsafe { libc::geteuid() } == 0 {
            println!("  Already root, not using fake root");
            return Ok(Self {
                scope: None,
                cleanup_id: None,
            });
        }

        let (prefix, lib) = match locate_libpseudo(native_root) {
            Some(found) => found,
            None => bail!(
                "Could not locate libpseudo.so. Unprivileged installs need pseudo.\n\
                 Install it (e.g. sudo dnf install pseudo) or set 'native_root' \
                 to a sysroot that carries it."
            ),
        };

        let statedir = state_dir(workdir, target_rootfs);
        fs::create_dir_all(&statedir)?;

        debug!(lib = %lib.display(), statedir = %statedir.display(), "entering fake root");

        let vars = vec![
            (
                "PSEUDO_PREFIX".to_string(),
                prefix.to_string_lossy().into_owned(),
            ),
            (
                "PSEUDO_LOCALSTATEDIR".to_string(),
                statedir.to_string_lossy().into_owned(),
            ),
            ("PSEUDO_NOSYMLINKEXP".to_string(), "1".to_string()),
            (
                "LD_PRELOAD".to_string(),
                lib.to_string_lossy().into_owned(),
            ),
            ("LC_ALL".to_string(), "en_US.UTF-8".to_string()),
            // pseudo reads passwd/group from the target so chown calls in
            // scriptlets resolve names against the image, not the host.
            (
                "PSEUDO_PASSWD".to_string(),
                target_rootfs.to_string_lossy().into_owned(),
            ),
        ];

        let scope = EnvScope::apply(&vars);
        let saved = scope.saved.clone();
        let cleanup_id = cleanup::register(move || restore_env(&saved));

        Ok(Self {
            scope: Some(scope),
            cleanup_id: Some(cleanup_id),
        })
    }

    /// Restore the previous environment. Idempotent.
    pub fn exit(&mut self) {
        if let Some(id) = self.cleanup_id.take() {
            cleanup::deregister(id);
        }
        if let Some(scope) = self.scope.take() {
            scope.restore();
        }
    }
}

impl Drop for FakerootEnv {
    fn drop(&mut self) {
        self.exit();
    }
}
