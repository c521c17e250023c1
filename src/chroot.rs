//! Chroot environment lifecycle.
//!
//! Between `prepare_chroot` and `cleanup_chroot` the image's partitions are
//! mounted at the chroot path and the target has been given:
//!
//! - the host's `resolv.conf` (its own is moved to `resolv.conf.bak`)
//! - a copy of the user-mode emulator binary at its host path
//! - a `/setup` scratch directory for staged target scripts
//!
//! `cleanup` reverses all three; `unmount_everything` then releases the
//! mounts and the loop device.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::{ScriptExecutor, TARGET_SCRATCH_DIR};
use crate::session::LoopDevice;
use crate::tools::{DiskUsageArgs, LosetupDetachArgs, MountArgs, RsyncOverlayArgs, UmountRecursiveArgs};

/// Host DNS configuration copied into the target.
pub const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

const RESOLV_CONF: &str = "etc/resolv.conf";
const RESOLV_CONF_BACKUP: &str = "etc/resolv.conf.bak";

/// Manages the mounted target filesystem at the chroot path.
#[derive(Debug)]
pub struct ChrootManager<'a> {
    executor: &'a ScriptExecutor,
    chroot_path: PathBuf,
    mounts: &'a [String],
    emulator_binary: &'a Path,
    host_resolv_conf: PathBuf,
}

impl<'a> ChrootManager<'a> {
    /// `mounts` lists mount points in partition order (partition 1 first);
    /// the root filesystem is expected last.
    pub fn new(
        executor: &'a ScriptExecutor,
        chroot_path: impl Into<PathBuf>,
        mounts: &'a [String],
        emulator_binary: &'a Path,
    ) -> Self {
        Self {
            executor,
            chroot_path: chroot_path.into(),
            mounts,
            emulator_binary,
            host_resolv_conf: PathBuf::from(HOST_RESOLV_CONF),
        }
    }

    /// Use a different host resolver file than `/etc/resolv.conf`.
    pub fn with_host_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_resolv_conf = path.into();
        self
    }

    pub fn chroot_path(&self) -> &Path {
        &self.chroot_path
    }

    /// Path below the chroot for an absolute-looking target path.
    pub fn target_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.chroot_path
            .join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Mount commands in execution order.
    ///
    /// Partition `i` (1-based) goes to the `i`-th mount point, processed in
    /// reverse so the root filesystem is mounted before anything nested in it.
    pub fn mount_plan(&self, device: &LoopDevice) -> Vec<MountArgs> {
        self.mounts
            .iter()
            .enumerate()
            .rev()
            .map(|(i, mount_point)| MountArgs {
                device: device.partition(i + 1),
                target: self.target_path(mount_point),
            })
            .collect()
    }

    /// Mount the partitions and install DNS, emulator and scratch directory.
    pub fn prepare(&self, device: &LoopDevice) -> Result<()> {
        for mount in self.mount_plan(device) {
            self.executor.run_tool(&mount)?;
        }
        self.install_support_files()
    }

    /// Everything `prepare` does after mounting.
    pub fn install_support_files(&self) -> Result<()> {
        info!("copy resolv.conf and qemu-user-static");

        let resolv = self.target_path(RESOLV_CONF);
        let backup = self.target_path(RESOLV_CONF_BACKUP);
        // symlink_metadata: resolv.conf is often a dangling symlink in images
        if fs::symlink_metadata(&resolv).is_ok() {
            fs::rename(&resolv, &backup)?;
        } else {
            warn!("{} does not exist, nothing to back up", resolv.display());
        }

        let emulator = self.target_path(self.emulator_binary);
        if let Some(parent) = emulator.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(self.emulator_binary, &emulator)?;

        if let Some(parent) = resolv.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&self.host_resolv_conf, &resolv)?;

        fs::create_dir_all(self.target_path(TARGET_SCRATCH_DIR))?;
        Ok(())
    }

    /// Copy each rootfs overlay into the chroot, in profile order.
    pub fn copy_overlays(&self, overlays: &[PathBuf]) -> Result<()> {
        for overlay in overlays {
            info!("copying {} into {}", overlay.display(), self.chroot_path.display());
            self.executor.run_tool(&RsyncOverlayArgs {
                source: overlay.clone(),
                destination: self.chroot_path.clone(),
            })?;
        }
        Ok(())
    }

    /// Restore the target's DNS configuration and remove the emulator and
    /// scratch directory.
    pub fn cleanup(&self) -> Result<()> {
        let resolv = self.target_path(RESOLV_CONF);
        let backup = self.target_path(RESOLV_CONF_BACKUP);

        remove_file_if_exists(&resolv)?;
        if fs::symlink_metadata(&backup).is_ok() {
            fs::rename(&backup, &resolv)?;
        }

        remove_file_if_exists(&self.target_path(self.emulator_binary))?;

        let scratch = self.target_path(TARGET_SCRATCH_DIR);
        if let Err(e) = fs::remove_dir_all(&scratch) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", scratch.display(), e);
            }
        }
        Ok(())
    }

    /// Report final usage, unmount everything below the chroot path and
    /// release the loop device.
    pub fn unmount_everything(&self, device: &LoopDevice) -> Result<()> {
        info!("Final system size:");
        self.executor.run_tool(&DiskUsageArgs {
            path: self.chroot_path.clone(),
        })?;

        info!("unmounting everything");
        self.executor.run_tool(&UmountRecursiveArgs {
            target: self.chroot_path.clone(),
        })?;
        self.executor.run_tool(&LosetupDetachArgs {
            device: device.path().to_path_buf(),
        })?;
        debug!("released loop device {}", device);
        Ok(())
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
