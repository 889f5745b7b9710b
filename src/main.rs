//! Rootstrap - package-based root filesystem builder.
//!
//! Assembles a bootable root filesystem from binary package feeds using the
//! distribution's own package manager, without ever booting the target:
//! - rpm images through dnf
//! - deb images through apt-get and dpkg
//! - stock Debian images through debootstrap and chroot

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use rootstrap::{cleanup, commands, logging};

#[derive(Parser)]
#[command(name = "rootstrap")]
#[command(about = "Package-based root filesystem builder")]
#[command(
    after_help = "QUICK START:\n  rootstrap preflight   Check the host can build the image\n  rootstrap build       Build the root filesystem\n  rootstrap show config Print the merged configuration\n  rootstrap clean       Remove build artifacts"
)]
struct Cli {
    /// Image description (TOML)
    #[arg(short, long, global = true, default_value = "image.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the root filesystem described by the config
    Build {
        /// Keep the previously generated rootfs and continue on top of it
        #[arg(long)]
        no_clean: bool,

        /// Skip preflight checks
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Clean build artifacts (default: rootfs and fake root state)
    Clean {
        #[command(subcommand)]
        what: Option<CleanTarget>,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Run preflight checks (verify the host before a build)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum CleanTarget {
    /// Remove the generated rootfs and fake root state
    Rootfs,
    /// Remove backend scratch state (feed registry, intercepts, logs)
    Temp,
    /// Remove the whole work directory
    All,
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show the merged configuration
    Config,
    /// Show the package manifest of the last build
    Manifest,
}

fn main() -> Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();
    logging::init();
    cleanup::install_signal_handler()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            no_clean,
            skip_preflight,
        } => {
            commands::cmd_build(&cli.config, no_clean, skip_preflight)?;
        }

        Commands::Clean { what } => {
            let clean_target = match what {
                None | Some(CleanTarget::Rootfs) => commands::clean::CleanTarget::Rootfs,
                Some(CleanTarget::Temp) => commands::clean::CleanTarget::Temp,
                Some(CleanTarget::All) => commands::clean::CleanTarget::All,
            };
            commands::cmd_clean(&cli.config, clean_target)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Manifest => commands::show::ShowTarget::Manifest,
            };
            commands::cmd_show(&cli.config, show_target)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&cli.config, strict)?;
        }
    }

    Ok(())
}
