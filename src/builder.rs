//! Build orchestration.
//!
//! [`Builder`] owns everything a build needs: the merged configuration, the
//! child process registry and the executor. Construction resolves profiles
//! and runs the pre-flight checks, so no destructive action happens unless
//! all of them pass. [`Builder::build`] then walks the canonical pipeline
//! through a [`StepRunner`].

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::chroot::ChrootManager;
use crate::config::{BuildConfig, ImageSettings};
use crate::error::{BuildError, Result};
use crate::executor::ScriptExecutor;
use crate::image::{ImageLifecycle, PROGRESS_FILTER};
use crate::preflight;
use crate::process_guard::{ProcessGuard, SharedRegistry};
use crate::profile::{ProfileResolver, ScriptSlot};
use crate::runner::{Confirm, StepRunner};
use crate::session::SessionStore;
use crate::steps::Step;

pub const DEFAULT_CACHE_DIR: &str = "cache";
pub const DEFAULT_OUT_DIR: &str = "out";
pub const DEFAULT_CHROOT_PATH: &str = "/tmp/rpi4-image-build";
pub const DEFAULT_EMULATOR: &str = "systemd-nspawn";

/// Catalog of the source tree the binary was built from
const BUILD_TREE_CATALOG_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");
/// Catalog locations relative to the directory holding the binary
const INSTALLED_CATALOG_DIRS: [&str; 2] = ["data", "../share/image-builder/data"];

const CACHE_DIR_MODE: u32 = 0o777;

/// Locations and host settings for a build.
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub cache_dir: PathBuf,
    pub out_dir: PathBuf,
    pub chroot_path: PathBuf,
    /// Directory searched for profiles given by name
    pub catalog_dir: PathBuf,
    /// Emulated-execution wrapper for target scripts
    pub emulator: String,
    /// Development only: build without root
    pub skip_root_check: bool,
    /// Command placed between the extractor and the output image
    pub progress_filter: String,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            chroot_path: PathBuf::from(DEFAULT_CHROOT_PATH),
            catalog_dir: default_catalog_dir(),
            emulator: DEFAULT_EMULATOR.to_string(),
            skip_root_check: false,
            progress_filter: PROGRESS_FILTER.to_string(),
        }
    }
}

impl BuilderOptions {
    /// Same options with cache, output and chroot paths made absolute.
    pub fn absolutized(&self) -> Result<Self> {
        Ok(Self {
            cache_dir: std::path::absolute(&self.cache_dir)?,
            out_dir: std::path::absolute(&self.out_dir)?,
            chroot_path: std::path::absolute(&self.chroot_path)?,
            ..self.clone()
        })
    }

    /// Environment every script sees unless a profile overrides it.
    pub fn env_defaults(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("CACHE_DIR".to_string(), self.cache_dir.display().to_string()),
            ("OUT_DIR".to_string(), self.out_dir.display().to_string()),
            ("CHROOT_PATH".to_string(), self.chroot_path.display().to_string()),
        ])
    }
}

/// The built-in profile catalog.
///
/// Looks next to the running binary first (`<bin>/data`, then
/// `<prefix>/share/image-builder/data`) and falls back to the catalog of the
/// source tree, which is what `cargo run` sees.
pub fn default_catalog_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| installed_catalog_dir(&exe))
        .unwrap_or_else(|| PathBuf::from(BUILD_TREE_CATALOG_DIR))
}

fn installed_catalog_dir(exe: &Path) -> Option<PathBuf> {
    let bin_dir = exe.parent()?;
    INSTALLED_CATALOG_DIRS
        .iter()
        .map(|relative| bin_dir.join(relative))
        .find(|candidate| candidate.is_dir())
}

/// Resolve `profile_ids` and merge them over the option-derived environment.
///
/// No pre-flight checks run here.
pub fn load_config<S: AsRef<str>>(profile_ids: &[S], options: &BuilderOptions) -> Result<BuildConfig> {
    let resolver = ProfileResolver::new(&options.catalog_dir);
    let profiles = resolver.load_all(profile_ids)?;
    Ok(BuildConfig::merge(options.env_defaults(), profiles))
}

/// One image build.
#[derive(Debug)]
pub struct Builder {
    options: BuilderOptions,
    config: BuildConfig,
    settings: ImageSettings,
    guard: ProcessGuard,
    executor: ScriptExecutor,
}

impl Builder {
    /// Resolve and merge `profile_ids`, then verify the build can proceed.
    ///
    /// # Errors
    ///
    /// `ProfileNotFound` for an unresolvable profile, `Config` for an
    /// unreadable `config.ini`, `Precondition` listing every failed check.
    pub fn new<S: AsRef<str>>(profile_ids: &[S], options: BuilderOptions) -> Result<Self> {
        if profile_ids.is_empty() {
            return Err(BuildError::config("at least one profile is required"));
        }
        let options = options.absolutized()?;
        let config = load_config(profile_ids, &options)?;
        preflight::verify(&config, options.skip_root_check, &options.emulator)?;
        Self::with_config(config, options)
    }

    /// Build from an already merged configuration, skipping pre-flight checks.
    pub fn with_config(config: BuildConfig, options: BuilderOptions) -> Result<Self> {
        let settings = config.image_settings()?;

        if let Some(pause) = config.pause_after() {
            if config.pause_step().is_none() {
                warn!(
                    "pause_after={} does not name a build step and is ignored; valid steps: {}",
                    pause,
                    Step::pipeline()
                        .iter()
                        .map(|s| s.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        }

        let guard = ProcessGuard::new();
        let executor = ScriptExecutor::new(
            config.env_vars().clone(),
            &options.chroot_path,
            options.emulator.clone(),
            guard.registry(),
        );

        Ok(Self {
            options,
            config,
            settings,
            guard,
            executor,
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    /// Registry of running children, for signal handlers.
    pub fn child_registry(&self) -> SharedRegistry {
        self.guard.registry()
    }

    /// Run every step not yet completed and end the session.
    ///
    /// Returns the path of the finished image.
    pub fn build<C: Confirm>(&self, confirm: C) -> Result<PathBuf> {
        self.config.log_summary();

        create_cache_dir(&self.options.cache_dir)?;
        fs::create_dir_all(&self.options.chroot_path)?;

        let session = SessionStore::new(&self.options.cache_dir);
        session.start()?;

        let image = ImageLifecycle::new(
            &self.executor,
            &self.settings,
            &self.options.cache_dir,
            &self.options.out_dir,
        )
        .with_progress_filter(&self.options.progress_filter);
        let chroot = ChrootManager::new(
            &self.executor,
            &self.options.chroot_path,
            &self.settings.mounts,
            &self.settings.emulator_binary,
        );

        let mut runner = StepRunner::new(session, self.config.pause_step(), confirm);
        runner.run_pipeline(&Step::pipeline(), |step, session| {
            self.execute(step, session, &image, &chroot)
        })?;

        runner.into_session().end()?;

        let output = image.output_path();
        info!("----------------------------------------");
        info!("image built at {}", output.display());
        info!("----------------------------------------");
        Ok(output)
    }

    fn execute(
        &self,
        step: Step,
        session: &mut SessionStore,
        image: &ImageLifecycle<'_>,
        chroot: &ChrootManager<'_>,
    ) -> Result<()> {
        match step {
            Step::DownloadAndExtractImage => {
                image.download_and_extract(required_script(
                    self.config.extract_image(),
                    "extract-image",
                )?)?;
            }
            Step::SetupLoopDeviceAndMountPartitions => {
                let setup =
                    required_script(self.config.loop_device_setup(), "loop-device-setup")?;
                session.load_or_allocate(|| image.grow_and_bind_loop_device(setup))?;
            }
            Step::PrepareChroot => chroot.prepare(&session.loop_device()?)?,
            Step::CopyRootfsOverlaysToChroot => {
                chroot.copy_overlays(self.config.rootfs_overlays())?
            }
            Step::RunPhase1HostScripts => self.run_scripts(ScriptSlot::Phase1Host)?,
            Step::RunPhase1TargetScripts => self.run_scripts(ScriptSlot::Phase1Target)?,
            Step::RunPhase2HostScripts => self.run_scripts(ScriptSlot::Phase2Host)?,
            Step::RunPhase2TargetScripts => self.run_scripts(ScriptSlot::Phase2Target)?,
            Step::CleanupChroot => chroot.cleanup()?,
            Step::UnmountEverything => chroot.unmount_everything(&session.loop_device()?)?,
        }
        Ok(())
    }

    fn run_scripts(&self, slot: ScriptSlot) -> Result<()> {
        let scripts = self.config.scripts(slot);
        if scripts.is_empty() {
            info!("no {} scripts to run", slot);
        }
        for script in scripts {
            info!("running {} script {}", slot, script.display());
            if slot.runs_in_target() {
                self.executor.run_script_on_target(script, &[])?;
            } else {
                self.executor.run_script_on_host(script, &[])?;
            }
        }
        Ok(())
    }
}

// Pre-flight guarantees these for `Builder::new`; `with_config` does not.
fn required_script<'a>(script: Option<&'a Path>, name: &str) -> Result<&'a Path> {
    script.ok_or_else(|| BuildError::config(format!("no profile provides a {} script", name)))
}

fn create_cache_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(CACHE_DIR_MODE))?;
    Ok(())
}
