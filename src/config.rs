//! Merged build configuration.
//!
//! Profiles are folded left to right into a single [`BuildConfig`]:
//! variables from later profiles override earlier ones, script and overlay
//! lists are concatenated in profile order, and the extract-image and
//! loop-device-setup scripts are taken from the last profile providing them.
//! The result is immutable for the rest of the build.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::{BuildError, Result};
use crate::profile::{Profile, ScriptSlot, script_slots};
use crate::steps::Step;

/// Build variables every build must define.
pub const REQUIRED_VARIABLES: &[&str] = &[
    "image_mounts",
    "image_size",
    "image_url",
    "output_filename",
    "qemu_user_static_path",
];

/// Optional build variable naming the step after which to pause.
pub const PAUSE_AFTER_VARIABLE: &str = "pause_after";

/// The single source of truth for a build, merged from all profiles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildConfig {
    profile_dirs: Vec<PathBuf>,
    build_vars: BTreeMap<String, String>,
    env_vars: BTreeMap<String, String>,
    phase1_host: Vec<PathBuf>,
    phase1_target: Vec<PathBuf>,
    phase2_host: Vec<PathBuf>,
    phase2_target: Vec<PathBuf>,
    rootfs_overlays: Vec<PathBuf>,
    extract_image: Option<PathBuf>,
    loop_device_setup: Option<PathBuf>,
}

impl BuildConfig {
    /// Merge `profiles` in order on top of the engine-provided environment.
    pub fn merge(
        env_defaults: BTreeMap<String, String>,
        profiles: impl IntoIterator<Item = Profile>,
    ) -> Self {
        let mut config = Self {
            env_vars: env_defaults,
            ..Self::default()
        };

        for profile in profiles {
            config.build_vars.extend(profile.build_vars);
            config.env_vars.extend(profile.env_vars);

            let caps = profile.capabilities;
            config.phase1_host.extend(caps.phase1_host);
            config.phase1_target.extend(caps.phase1_target);
            config.phase2_host.extend(caps.phase2_host);
            config.phase2_target.extend(caps.phase2_target);
            config.rootfs_overlays.extend(caps.rootfs);
            if caps.extract_image.is_some() {
                config.extract_image = caps.extract_image;
            }
            if caps.loop_device_setup.is_some() {
                config.loop_device_setup = caps.loop_device_setup;
            }

            config.profile_dirs.push(profile.dir);
        }

        config
    }

    pub fn profile_dirs(&self) -> &[PathBuf] {
        &self.profile_dirs
    }

    pub fn build_vars(&self) -> &BTreeMap<String, String> {
        &self.build_vars
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env_vars
    }

    pub fn build_var(&self, key: &str) -> Option<&str> {
        self.build_vars.get(key).map(String::as_str)
    }

    /// A build variable that must be defined.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.build_var(key).ok_or_else(|| {
            BuildError::config(format!(
                "variable {} is not defined in any profiles but is required",
                key
            ))
        })
    }

    /// Scripts contributed to `slot`, in profile order.
    pub fn scripts(&self, slot: ScriptSlot) -> &[PathBuf] {
        match slot {
            ScriptSlot::Phase1Host => &self.phase1_host,
            ScriptSlot::Phase1Target => &self.phase1_target,
            ScriptSlot::Phase2Host => &self.phase2_host,
            ScriptSlot::Phase2Target => &self.phase2_target,
        }
    }

    pub fn rootfs_overlays(&self) -> &[PathBuf] {
        &self.rootfs_overlays
    }

    pub fn extract_image(&self) -> Option<&Path> {
        self.extract_image.as_deref()
    }

    pub fn loop_device_setup(&self) -> Option<&Path> {
        self.loop_device_setup.as_deref()
    }

    /// Required variables that no profile defined.
    pub fn missing_required_variables(&self) -> Vec<&'static str> {
        REQUIRED_VARIABLES
            .iter()
            .copied()
            .filter(|var| !self.build_vars.contains_key(*var))
            .collect()
    }

    /// The raw `pause_after` value, if set and non-empty.
    pub fn pause_after(&self) -> Option<&str> {
        self.build_var(PAUSE_AFTER_VARIABLE)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// The step to pause after, if `pause_after` names a known step.
    pub fn pause_step(&self) -> Option<Step> {
        self.pause_after().and_then(Step::from_name)
    }

    /// Typed view of the required image variables.
    pub fn image_settings(&self) -> Result<ImageSettings> {
        // Entry N is the mount point of partition N
        let mut mounts = Vec::new();
        for (index, mount) in self.require("image_mounts")?.split(',').enumerate() {
            let mount = mount.trim();
            if mount.is_empty() {
                return Err(BuildError::config(format!(
                    "image_mounts entry for partition {} is empty",
                    index + 1
                )));
            }
            mounts.push(mount.to_string());
        }

        let emulator_binary = PathBuf::from(self.require("qemu_user_static_path")?);
        if !emulator_binary.is_absolute() {
            return Err(BuildError::config(format!(
                "qemu_user_static_path must be an absolute path, got {}",
                emulator_binary.display()
            )));
        }

        Ok(ImageSettings {
            image_url: self.require("image_url")?.to_string(),
            image_size: self.require("image_size")?.to_string(),
            output_filename: self.require("output_filename")?.to_string(),
            mounts,
            emulator_binary,
        })
    }

    /// Log the build banner: profiles, variables and contributed scripts.
    pub fn log_summary(&self) {
        info!("Build information");
        info!("=================");
        let profiles: Vec<String> = self
            .profile_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        info!("Profiles: {}", profiles.join(","));
        info!("");
        info!("Build variables");
        info!("---------------");
        log_aligned(&self.build_vars);
        info!("");
        info!("Environment variables");
        info!("---------------------");
        log_aligned(&self.env_vars);
        info!("");
        info!("Custom scripts");
        info!("--------------");
        for slot in script_slots() {
            for script in self.scripts(slot) {
                info!("{:<14} {}", format!("{}:", slot), script.display());
            }
        }
    }
}

fn log_aligned(vars: &BTreeMap<String, String>) {
    let width = vars.keys().map(String::len).max().unwrap_or(0);
    for (key, value) in vars {
        info!("{:<width$} = {}", key, value, width = width);
    }
}

/// Required image variables, validated and typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSettings {
    /// Where the base image is downloaded from
    pub image_url: String,
    /// Target image size, as understood by `truncate -s`
    pub image_size: String,
    /// File name of the built image inside the output directory
    pub output_filename: String,
    /// Mount points in partition order; the root filesystem is last
    pub mounts: Vec<String>,
    /// Absolute path of the user-mode emulator binary, identical on host and target
    pub emulator_binary: PathBuf,
}

impl ImageSettings {
    /// File name of the cached download: the basename of the image URL.
    pub fn download_name(&self) -> Result<String> {
        let path = self
            .image_url
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        path.rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                BuildError::config(format!(
                    "image_url {} does not end in a file name",
                    self.image_url
                ))
            })
    }
}
