//! CLI command handlers.
//!
//! Each submodule handles one CLI command:
//! - `build` - assemble the root filesystem
//! - `clean` - remove build artifacts
//! - `show` - display configuration and manifests
//! - `preflight` - run host checks

pub mod build;
pub mod clean;
mod preflight;
pub mod show;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use preflight::cmd_preflight;
pub use show::cmd_show;
