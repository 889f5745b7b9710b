//! Rootstrap library.
//!
//! Builds root filesystems by driving a native package manager (dnf, apt or
//! debootstrap plus chroot) against an offline target directory. The binary
//! in `main.rs` is a thin CLI over these modules; integration tests exercise
//! them directly.

pub mod backend;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod fakeroot;
pub mod logging;
pub mod manifest;
pub mod mounts;
pub mod preflight;
pub mod process;
pub mod rootfs;
