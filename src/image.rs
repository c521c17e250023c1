//! Base image download, extraction, growth and loop device binding.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::ImageSettings;
use crate::error::{BuildError, Result};
use crate::executor::{HostCommand, ScriptExecutor};
use crate::session::LoopDevice;
use crate::tools::{LosetupAttachArgs, PartedResizeArgs, PartxListArgs, TruncateArgs, WgetArgs};

/// Default progress filter placed between the extractor and the output file.
pub const PROGRESS_FILTER: &str = "pv";

/// What `fetch` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A file with the URL's basename was already in the cache
    CacheHit,
    Downloaded,
}

/// Image file lifecycle for one build.
#[derive(Debug)]
pub struct ImageLifecycle<'a> {
    executor: &'a ScriptExecutor,
    settings: &'a ImageSettings,
    cache_dir: PathBuf,
    out_dir: PathBuf,
    progress_filter: String,
}

impl<'a> ImageLifecycle<'a> {
    pub fn new(
        executor: &'a ScriptExecutor,
        settings: &'a ImageSettings,
        cache_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            settings,
            cache_dir: cache_dir.into(),
            out_dir: out_dir.into(),
            progress_filter: PROGRESS_FILTER.to_string(),
        }
    }

    /// Replace the `pv` progress filter (any stdin-to-stdout command).
    pub fn with_progress_filter(mut self, filter: impl Into<String>) -> Self {
        self.progress_filter = filter.into();
        self
    }

    /// `<cache>/<basename of image_url>`
    pub fn cached_download_path(&self) -> Result<PathBuf> {
        Ok(self.cache_dir.join(self.settings.download_name()?))
    }

    /// `<out>/<output_filename>`
    pub fn output_path(&self) -> PathBuf {
        self.out_dir.join(&self.settings.output_filename)
    }

    /// Download the base image into the cache unless it is already there.
    ///
    /// The cache is keyed only by the URL's file name; a changed upstream
    /// image behind the same URL is not detected. Downloads land in a
    /// `.part` file first so an interrupted fetch is never taken for a hit.
    pub fn fetch(&self) -> Result<FetchOutcome> {
        let cached = self.cached_download_path()?;
        if cached.is_file() {
            info!(
                "already downloaded {}, so only re-extracting it",
                cached.display()
            );
            return Ok(FetchOutcome::CacheHit);
        }

        let mut partial = cached.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        info!("downloading {}", self.settings.image_url);
        self.executor.run_tool(&WgetArgs {
            url: self.settings.image_url.clone(),
            output: partial.clone(),
        })?;
        fs::rename(&partial, &cached)?;
        Ok(FetchOutcome::Downloaded)
    }

    /// Extract the cached download into the output image with the profile's
    /// extract-image script: `<extract> <download> | pv > <output>`.
    pub fn extract(&self, extract_script: &Path) -> Result<()> {
        let cached = self.cached_download_path()?;
        let output = self.output_path();
        fs::create_dir_all(&self.out_dir)?;

        info!(
            "extracting {} into {}",
            cached.file_name().unwrap_or_default().to_string_lossy(),
            output.display()
        );
        let pipeline = format!("\"$1\" \"$2\" | {} > \"$3\"", self.progress_filter);
        self.executor.run_host(&HostCommand::shell(
            pipeline,
            [
                extract_script.as_os_str(),
                cached.as_os_str(),
                output.as_os_str(),
            ],
        ))
    }

    /// Fetch (or reuse) the base image, then always re-extract it.
    pub fn download_and_extract(&self, extract_script: &Path) -> Result<FetchOutcome> {
        let outcome = self.fetch()?;
        self.extract(extract_script)?;
        Ok(outcome)
    }

    /// Grow the image to `image_size`, extend its last partition to the new
    /// end, bind it to a loop device and run the profile's loop-device-setup
    /// script with the device path.
    pub fn grow_and_bind_loop_device(&self, loop_device_setup: &Path) -> Result<LoopDevice> {
        let output = self.output_path();

        info!(
            "expanding image to {} with truncate",
            self.settings.image_size
        );
        self.executor.run_tool(&TruncateArgs {
            size: self.settings.image_size.clone(),
            path: output.clone(),
        })?;

        let end_mb = partition_end_mb(fs::metadata(&output)?.len());
        let partitions = count_partitions(&self.executor.capture_tool(&PartxListArgs {
            image: output.clone(),
        })?);
        if partitions == 0 {
            return Err(BuildError::config(format!(
                "{} has no partitions to grow",
                output.display()
            )));
        }

        info!(
            "growing the last partition (partition number={}) to {}MB",
            partitions, end_mb
        );
        self.executor.run_tool(&PartedResizeArgs {
            image: output.clone(),
            partition: partitions,
            end_mb,
        })?;

        let device = self.attach(&output)?;
        self.executor
            .run_script_on_host(loop_device_setup, &[device.to_string()])?;
        Ok(device)
    }

    fn attach(&self, image: &Path) -> Result<LoopDevice> {
        let stdout = self.executor.capture_tool(&LosetupAttachArgs {
            image: image.to_path_buf(),
        })?;
        let path = stdout.trim();
        if path.is_empty() {
            return Err(BuildError::resource_state(
                "losetup did not report a loop device",
            ));
        }
        info!("bound {} to {}", image.display(), path);
        Ok(LoopDevice::new(path))
    }
}

/// New end of the last partition in (decimal) megabytes for an image of
/// `size_bytes`, rounded to the nearest megabyte.
pub fn partition_end_mb(size_bytes: u64) -> u64 {
    (size_bytes + 500_000) / 1_000_000
}

/// Number of partitions in `partx -g` output (one non-empty line each).
pub fn count_partitions(partx_output: &str) -> usize {
    partx_output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_guard::ProcessGuard;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn settings(url: &str) -> ImageSettings {
        ImageSettings {
            image_url: url.to_string(),
            image_size: "4G".to_string(),
            output_filename: "rt.img".to_string(),
            mounts: vec!["/boot/firmware".to_string(), "/".to_string()],
            emulator_binary: PathBuf::from("/usr/bin/qemu-aarch64-static"),
        }
    }

    fn executable(path: &Path, body: &str) {
        fs::write(path, body).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_partition_end_mb_rounds_to_nearest() {
        assert_eq!(partition_end_mb(4 * 1024 * 1024 * 1024), 4295);
        assert_eq!(partition_end_mb(1_499_999), 1);
        assert_eq!(partition_end_mb(1_500_000), 2);
        assert_eq!(partition_end_mb(0), 0);
    }

    #[test]
    fn test_count_partitions() {
        let output = "1      2048    526335    524288 \n2    526336   8388574   7862239 \n";
        assert_eq!(count_partitions(output), 2);
        assert_eq!(count_partitions(""), 0);
        assert_eq!(count_partitions("\n\n"), 0);
    }

    #[test]
    fn test_paths() {
        let guard = ProcessGuard::new();
        let exec = ScriptExecutor::new(BTreeMap::new(), "/tmp/chroot", "systemd-nspawn", guard.registry());
        let s = settings("https://example.com/dl/base.img.xz");
        let image = ImageLifecycle::new(&exec, &s, "cache", "out");

        assert_eq!(
            image.cached_download_path().unwrap(),
            PathBuf::from("cache/base.img.xz")
        );
        assert_eq!(image.output_path(), PathBuf::from("out/rt.img"));
    }

    #[test]
    fn test_cache_hit_skips_network_and_extracts() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache");
        let out = dir.path().join("out");
        fs::create_dir_all(&cache).unwrap();
        fs::write(cache.join("base.img.xz"), "raw image bytes").unwrap();
        let extract = dir.path().join("extract-image");
        executable(&extract, "#!/bin/sh\ncat \"$1\"\n");

        let guard = ProcessGuard::new();
        let exec = ScriptExecutor::new(BTreeMap::new(), dir.path(), "systemd-nspawn", guard.registry());
        // Unroutable URL: any fetch attempt would fail the test
        let s = settings("http://invalid.invalid/base.img.xz");
        let image = ImageLifecycle::new(&exec, &s, &cache, &out).with_progress_filter("cat");

        let outcome = image.download_and_extract(&extract).unwrap();

        assert_eq!(outcome, FetchOutcome::CacheHit);
        assert_eq!(
            fs::read_to_string(out.join("rt.img")).unwrap(),
            "raw image bytes"
        );
    }

    #[test]
    fn test_failed_extraction_is_command_error() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        fs::write(cache.join("base.img.xz"), "x").unwrap();
        let extract = dir.path().join("extract-image");
        executable(&extract, "#!/bin/sh\nexit 1\n");

        let guard = ProcessGuard::new();
        let exec = ScriptExecutor::new(BTreeMap::new(), dir.path(), "systemd-nspawn", guard.registry());
        let s = settings("http://invalid.invalid/base.img.xz");
        let image = ImageLifecycle::new(&exec, &s, &cache, dir.path().join("out"))
            .with_progress_filter("cat");

        let err = image.extract(&extract).unwrap_err();
        assert!(matches!(err, BuildError::Command { .. }));
    }
}
