use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::builder::{
    BuilderOptions, DEFAULT_CACHE_DIR, DEFAULT_CHROOT_PATH, DEFAULT_EMULATOR, DEFAULT_OUT_DIR,
    default_catalog_dir,
};

/// Build disk images from layered profiles, resuming interrupted builds
#[derive(Parser)]
#[command(name = "build-image")]
#[command(about = "Profile-driven, resumable disk image builder")]
#[command(version)]
pub struct Cli {
    /// Log every command and environment (debug level)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build an image from the given profiles, later profiles overriding earlier ones
    Build {
        /// Profile directories or names in the built-in catalog
        #[arg(required = true)]
        profiles: Vec<String>,

        /// Download cache and session record location
        #[arg(long, default_value = DEFAULT_CACHE_DIR)]
        cache_dir: PathBuf,

        /// Where the finished image is written
        #[arg(long, default_value = DEFAULT_OUT_DIR)]
        out_dir: PathBuf,

        /// Mount point for the image's partitions
        #[arg(long, default_value = DEFAULT_CHROOT_PATH)]
        chroot_path: PathBuf,

        /// Built-in profile catalog
        #[arg(long, default_value_os_t = default_catalog_dir())]
        data_dir: PathBuf,

        /// Emulated-execution wrapper used for target scripts
        #[arg(long, default_value = DEFAULT_EMULATOR)]
        emulator: String,

        /// Do not require root (development only)
        #[arg(long)]
        skip_root_check: bool,
    },
    /// Show the steps completed by the current session
    Status {
        #[arg(long, default_value = DEFAULT_CACHE_DIR)]
        cache_dir: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the build steps (valid values for pause_after)
    Steps,
    /// Forget the current session so the next build starts from scratch
    ///
    /// Does not release mounts or loop devices; do that by hand first.
    Reset {
        #[arg(long, default_value = DEFAULT_CACHE_DIR)]
        cache_dir: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

impl Commands {
    /// Builder options for a `build` command.
    pub fn builder_options(&self) -> Option<BuilderOptions> {
        match self {
            Commands::Build {
                cache_dir,
                out_dir,
                chroot_path,
                data_dir,
                emulator,
                skip_root_check,
                ..
            } => Some(BuilderOptions {
                cache_dir: cache_dir.clone(),
                out_dir: out_dir.clone(),
                chroot_path: chroot_path.clone(),
                catalog_dir: data_dir.clone(),
                emulator: emulator.clone(),
                skip_root_check: *skip_root_check,
                ..BuilderOptions::default()
            }),
            _ => None,
        }
    }
}
