//! Process-wide cleanup registry.
//!
//! Bind mounts and the fakeroot environment outlive any single function and
//! must be undone even when the build is killed. Normal flow relies on scope
//! guards (`Drop` runs on every exit path); this registry exists for the
//! signal path. Guards register a cleanup action here and deregister it when
//! they drop; SIGINT/SIGTERM drains whatever is still registered, newest
//! first, then exits.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

type CleanupFn = Box<dyn FnOnce() + Send>;

static REGISTRY: Mutex<BTreeMap<u64, CleanupFn>> = Mutex::new(BTreeMap::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a registered cleanup action.
///
/// `deregister` it once the owning guard has done its own teardown.
#[derive(Debug)]
pub struct CleanupId(u64);

/// Register an action to run if the process is terminated by signal.
pub fn register<F>(action: F) -> CleanupId
where
    F: FnOnce() + Send + 'static,
{
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut registry) = REGISTRY.lock() {
        registry.insert(id, Box::new(action));
    }
    CleanupId(id)
}

/// Remove a previously registered action without running it.
pub fn deregister(id: CleanupId) {
    if let Ok(mut registry) = REGISTRY.lock() {
        registry.remove(&id.0);
    }
}

/// Run and drop every registered action, newest first.
///
/// Called by the signal handler; callable from tests. Actions run at most
/// once because they are removed from the registry before running.
pub fn run_all() {
    let actions: Vec<CleanupFn> = match REGISTRY.lock() {
        Ok(mut registry) => std::mem::take(&mut *registry)
            .into_iter()
            .rev()
            .map(|(_, action)| action)
            .collect(),
        Err(_) => {
            warn!("cleanup registry poisoned, skipping signal cleanup");
            return;
        }
    };

    for action in actions {
        action();
    }
}

/// Install the SIGINT/SIGTERM handler. Call once, early in main.
pub fn install_signal_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        println!();
        println!("Interrupted, cleaning up...");
        run_all();
        std::process::exit(130);
    })
    .context("Failed to install signal handler")
}
