//! Build Step Sequence
//!
//! The pipeline is a fixed, ordered list of named steps. Each step is a unit of
//! work whose completion is recorded in the session so that a resumed build
//! skips it. Step names are the persisted identifiers: they are written to the
//! session record and matched against the `pause_after` build variable, so they
//! must never be renamed.
//!
//! # Step Flow
//!
//! ```text
//! download_and_extract_image_if_necessary
//!     ↓
//! setup_loop_device_and_mount_partitions
//!     ↓
//! prepare_chroot
//!     ↓
//! copy_files_to_chroot
//!     ↓
//! run_phase1_host_scripts → run_phase1_target_scripts
//!     ↓
//! run_phase2_host_scripts → run_phase2_target_scripts
//!     ↓
//! cleanup_chroot
//!     ↓
//! umount_everything
//! ```

use strum::{AsRefStr, Display, EnumCount, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// A named step of the build pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    Display,
    EnumCount,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
pub enum Step {
    /// Fetch the base image into the cache (unless cached) and extract it
    #[strum(serialize = "download_and_extract_image_if_necessary")]
    DownloadAndExtractImage,

    /// Grow the image, resize its last partition and bind it to a loop device
    #[strum(serialize = "setup_loop_device_and_mount_partitions")]
    SetupLoopDeviceAndMountPartitions,

    /// Mount partitions at the chroot path and install DNS and emulation support
    #[strum(serialize = "prepare_chroot")]
    PrepareChroot,

    /// Copy every profile's rootfs overlay into the chroot
    #[strum(serialize = "copy_files_to_chroot")]
    CopyRootfsOverlaysToChroot,

    #[strum(serialize = "run_phase1_host_scripts")]
    RunPhase1HostScripts,

    #[strum(serialize = "run_phase1_target_scripts")]
    RunPhase1TargetScripts,

    /// Runs after phase 1 in the target so host-side cross compilation can
    /// consume what the target installed
    #[strum(serialize = "run_phase2_host_scripts")]
    RunPhase2HostScripts,

    #[strum(serialize = "run_phase2_target_scripts")]
    RunPhase2TargetScripts,

    /// Restore DNS resolution and remove the emulator and scratch directory
    #[strum(serialize = "cleanup_chroot")]
    CleanupChroot,

    /// Report usage, unmount the chroot recursively and release the loop device
    #[strum(serialize = "umount_everything")]
    UnmountEverything,
}

impl Step {
    /// The persisted name of this step.
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Steps that run on every invocation regardless of the session record.
    ///
    /// None of the canonical steps is safe to repeat, so this is currently
    /// false for all of them.
    pub const fn always_run(self) -> bool {
        match self {
            Self::DownloadAndExtractImage
            | Self::SetupLoopDeviceAndMountPartitions
            | Self::PrepareChroot
            | Self::CopyRootfsOverlaysToChroot
            | Self::RunPhase1HostScripts
            | Self::RunPhase1TargetScripts
            | Self::RunPhase2HostScripts
            | Self::RunPhase2TargetScripts
            | Self::CleanupChroot
            | Self::UnmountEverything => false,
        }
    }

    /// The canonical pipeline, in execution order.
    pub fn pipeline() -> Vec<Self> {
        Self::iter().collect()
    }

    /// Look a step up by its persisted name
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        let names: Vec<&str> = Step::pipeline().into_iter().map(Step::name).collect();
        assert_eq!(
            names,
            vec![
                "download_and_extract_image_if_necessary",
                "setup_loop_device_and_mount_partitions",
                "prepare_chroot",
                "copy_files_to_chroot",
                "run_phase1_host_scripts",
                "run_phase1_target_scripts",
                "run_phase2_host_scripts",
                "run_phase2_target_scripts",
                "cleanup_chroot",
                "umount_everything",
            ]
        );
        assert_eq!(Step::pipeline().len(), Step::COUNT);
    }

    #[test]
    fn test_name_matches_strum_serialization() {
        for step in Step::iter() {
            assert_eq!(step.name(), step.as_ref());
            assert_eq!(step.name(), step.to_string());
            assert_eq!(Step::from_name(step.name()), Some(step));
        }
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        assert_eq!(Step::from_name("prepare_chroot_now"), None);
        assert_eq!(Step::from_name("PrepareChroot"), None);
        assert_eq!(Step::from_name(""), None);
    }

    #[test]
    fn test_no_canonical_step_always_runs() {
        assert!(Step::iter().all(|s| !s.always_run()));
    }
}
