//! Image Builder Library
//!
//! Builds bootable disk images from an ordered list of profiles. A build runs
//! a fixed sequence of steps (download, loop device, chroot, overlays,
//! phase scripts, teardown) and records each completed step so that an
//! interrupted build resumes where it stopped.

pub mod builder;
pub mod chroot;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod image;
pub mod preflight;
pub mod process_guard;
pub mod profile;
pub mod runner;
pub mod session;
pub mod steps;
pub mod tools;

// Re-export main types for convenience
pub use builder::{Builder, BuilderOptions, load_config};
pub use chroot::ChrootManager;
pub use config::{BuildConfig, ImageSettings};
pub use error::{BuildError, CommandStatus, Result};
pub use executor::{HostCommand, ScriptExecutor, StagedScript};
pub use image::{FetchOutcome, ImageLifecycle};
pub use preflight::PreflightReport;
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use profile::{Profile, ProfileCapabilities, ProfileResolver, ScriptSlot};
pub use runner::{Confirm, FixedConfirm, StepOutcome, StepRunner, TerminalConfirm};
pub use session::{LoopDevice, SessionSnapshot, SessionStore};
pub use steps::Step;
pub use tools::ToolArgs;
