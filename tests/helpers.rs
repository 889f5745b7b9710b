//! Shared test utilities for rootstrap tests.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Test environment with a temporary workdir and target rootfs.
pub struct TestEnv {
    /// Kept alive for the lifetime of the environment.
    pub _temp_dir: TempDir,
    pub workdir: PathBuf,
    pub target_rootfs: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let workdir = temp_dir.path().join("work");
        let target_rootfs = workdir.join("rootfs");
        fs::create_dir_all(&workdir).expect("Failed to create workdir");

        Self {
            _temp_dir: temp_dir,
            workdir,
            target_rootfs,
        }
    }

    /// Write an image description next to the workdir and return its path.
    pub fn write_config(&self, content: &str) -> PathBuf {
        let path = self._temp_dir.path().join("image.toml");
        fs::write(&path, content).expect("Failed to write config");
        path
    }
}

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}

/// Assert that a file contains expected content.
pub fn assert_file_contains(path: &Path, expected: &str) {
    let content = fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read file {}: {}", path.display(), e));
    assert!(
        content.contains(expected),
        "File {} does not contain expected content.\nExpected to find: {}\nActual content: {}",
        path.display(),
        expected,
        content
    );
}
