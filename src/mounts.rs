//! Bind mounts for chroot package operations.
//!
//! The external Debian backend runs apt inside a chroot, which needs the
//! host's /dev, /proc and /sys visible in the target tree. Mounts are host
//! kernel state: leaving them behind corrupts later operations on the same
//! tree, so the guard unmounts on drop and registers with the cleanup
//! registry for the signal path. Unmount failures are logged, never
//! escalated.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::cleanup;
use crate::process::Cmd;

const MOUNT_POINTS: &[&str] = &["/dev", "/dev/pts", "/proc", "/sys"];
/// /dev/pts must go before /dev.
const UMOUNT_ORDER: &[&str] = &["/dev/pts", "/dev", "/proc", "/sys"];

fn mount_destination(target: &Path, point: &str) -> PathBuf {
    target.join(point.trim_start_matches('/'))
}

fn unmount_all(target: &Path) {
    for point in UMOUNT_ORDER {
        let dest = mount_destination(target, point);
        let result = Cmd::new("umount").arg_path(&dest).allow_fail().run();
        match result {
            Ok(result) if !result.success() => {
                warn!(point = %dest.display(), "umount failed: {}", result.stderr_trimmed());
            }
            Err(err) => warn!(point = %dest.display(), "umount failed: {err:#}"),
            Ok(_) => {}
        }
    }
}

/// Scope guard holding /dev, /dev/pts, /proc and /sys bound into a target
/// tree.
pub struct BindMounts {
    target: PathBuf,
    cleanup_id: Option<cleanup::CleanupId>,
    released: bool,
}

impl BindMounts {
    pub fn bind(target: &Path) -> Result<Self> {
        let mut guard = Self {
            target: target.to_path_buf(),
            cleanup_id: None,
            released: false,
        };

        for point in MOUNT_POINTS {
            let dest = mount_destination(target, point);
            fs::create_dir_all(&dest)?;
            Cmd::new("mount")
                .args(["-o", "bind", point])
                .arg_path(&dest)
                .error_msg(format!("Failed to bind mount {point} into target"))
                .run()?;
        }

        let registered_target = target.to_path_buf();
        guard.cleanup_id = Some(cleanup::register(move || unmount_all(&registered_target)));
        Ok(guard)
    }

    /// Unmount everything now instead of at drop. Idempotent.
    pub fn unmount(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(id) = self.cleanup_id.take() {
            cleanup::deregister(id);
        }
        unmount_all(&self.target);
    }
}

impl Drop for BindMounts {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_unmount_order_covers_every_mount_point() {
        let mounted: BTreeSet<_> = MOUNT_POINTS.iter().collect();
        let unmounted: BTreeSet<_> = UMOUNT_ORDER.iter().collect();
        assert_eq!(mounted, unmounted);
    }

    #[test]
    fn test_dev_pts_unmounts_before_dev() {
        let pts = UMOUNT_ORDER.iter().position(|p| *p == "/dev/pts").unwrap();
        let dev = UMOUNT_ORDER.iter().position(|p| *p == "/dev").unwrap();
        assert!(pts < dev);
    }

    #[test]
    fn test_mount_destination_stays_inside_target() {
        let dest = mount_destination(Path::new("/work/rootfs"), "/dev/pts");
        assert_eq!(dest, Path::new("/work/rootfs/dev/pts"));
    }
}
