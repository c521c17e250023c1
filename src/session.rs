//! Durable build session.
//!
//! A session is two small files in the cache directory:
//!
//! - `session.txt`: newline-delimited names of completed steps, append-only
//! - `loop-device.txt`: the loop device bound to the output image
//!
//! Both survive process restarts so an interrupted build resumes from the
//! last completed step and reuses the loop device it already allocated. They
//! are deleted together only after the final step succeeds.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{BuildError, Result};
use crate::steps::Step;

const SESSION_FILE: &str = "session.txt";
const LOOP_DEVICE_FILE: &str = "loop-device.txt";

/// Session files are world read/writable so an operator can inspect or edit
/// them without root.
const SESSION_FILE_MODE: u32 = 0o666;

/// A loop device bound to the output image, e.g. `/dev/loop7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LoopDevice(PathBuf);

impl LoopDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Device node of the 1-based partition `index` (`/dev/loop7` → `/dev/loop7p2`).
    pub fn partition(&self, index: usize) -> PathBuf {
        let mut node = self.0.clone().into_os_string();
        node.push(format!("p{}", index));
        PathBuf::from(node)
    }
}

impl fmt::Display for LoopDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Persisted record of completed steps and the allocated loop device.
#[derive(Debug)]
pub struct SessionStore {
    session_file: PathBuf,
    loop_device_file: PathBuf,
    /// Read from disk once, then served from memory
    loop_device: Option<LoopDevice>,
}

impl SessionStore {
    /// Open the session kept in `cache_dir`. Nothing is created until
    /// [`SessionStore::start`].
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        let cache_dir = cache_dir.as_ref();
        Self {
            session_file: cache_dir.join(SESSION_FILE),
            loop_device_file: cache_dir.join(LOOP_DEVICE_FILE),
            loop_device: None,
        }
    }

    pub fn session_file(&self) -> &Path {
        &self.session_file
    }

    pub fn loop_device_file(&self) -> &Path {
        &self.loop_device_file
    }

    /// True if a session record exists, i.e. a build is in progress.
    pub fn exists(&self) -> bool {
        self.session_file.is_file()
    }

    /// Ensure the session record exists.
    ///
    /// Returns true when an existing record was found and the build resumes.
    pub fn start(&self) -> Result<bool> {
        if self.exists() {
            info!(
                "resuming session from {} ({} step(s) already completed)",
                self.session_file.display(),
                self.completed_steps()?.len()
            );
            return Ok(true);
        }

        fs::File::create(&self.session_file)?;
        fs::set_permissions(
            &self.session_file,
            fs::Permissions::from_mode(SESSION_FILE_MODE),
        )?;
        debug!("created session file {}", self.session_file.display());
        Ok(false)
    }

    /// Names of completed steps in the order they were recorded.
    ///
    /// A missing record means nothing has completed yet.
    pub fn completed_steps(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.session_file) {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// True iff `name` has been recorded as completed.
    pub fn is_completed(&self, name: &str) -> Result<bool> {
        Ok(self.completed_steps()?.iter().any(|done| done == name))
    }

    pub fn step_completed(&self, step: Step) -> Result<bool> {
        self.is_completed(step.name())
    }

    /// Record `name` as completed. Recording an already-completed step is a no-op.
    pub fn mark_completed(&self, name: &str) -> Result<()> {
        if self.is_completed(name)? {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.session_file)?;
        writeln!(file, "{}", name)?;
        file.sync_all()?;
        debug!("recorded {} in session", name);
        Ok(())
    }

    /// Persist the loop device bound for this build.
    pub fn cache_loop_device(&mut self, device: &LoopDevice) -> Result<()> {
        fs::write(&self.loop_device_file, device.to_string())?;
        fs::set_permissions(
            &self.loop_device_file,
            fs::Permissions::from_mode(SESSION_FILE_MODE),
        )?;
        self.loop_device = Some(device.clone());
        Ok(())
    }

    /// The cached loop device, if one has been allocated.
    pub fn cached_loop_device(&mut self) -> Result<Option<LoopDevice>> {
        if self.loop_device.is_none() {
            match fs::read_to_string(&self.loop_device_file) {
                Ok(content) => {
                    let path = content.trim();
                    if !path.is_empty() {
                        self.loop_device = Some(LoopDevice::new(path));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.loop_device.clone())
    }

    /// The loop device allocated by an earlier step.
    ///
    /// # Errors
    ///
    /// `ResourceState` when no loop device has been cached yet: a step that
    /// needs the device ran before the step that allocates it.
    pub fn loop_device(&mut self) -> Result<LoopDevice> {
        self.cached_loop_device()?.ok_or_else(|| {
            BuildError::resource_state(format!(
                "no loop device recorded in {}; the loop device must be set up before it is used",
                self.loop_device_file.display()
            ))
        })
    }

    /// Reuse the cached loop device or allocate and cache a new one.
    pub fn load_or_allocate<F>(&mut self, allocate: F) -> Result<LoopDevice>
    where
        F: FnOnce() -> Result<LoopDevice>,
    {
        if let Some(device) = self.cached_loop_device()? {
            info!("reusing loop device {} from session", device);
            return Ok(device);
        }

        let device = allocate()?;
        self.cache_loop_device(&device)?;
        Ok(device)
    }

    /// Delete the session record and loop device record.
    pub fn end(&mut self) -> Result<()> {
        remove_if_exists(&self.session_file)?;
        remove_if_exists(&self.loop_device_file)?;
        self.loop_device = None;
        debug!("session ended");
        Ok(())
    }

    /// Point-in-time view of the session for status reporting.
    pub fn snapshot(&mut self) -> Result<SessionSnapshot> {
        let recorded = self.completed_steps()?;
        let (completed, pending) = Step::pipeline()
            .into_iter()
            .partition::<Vec<_>, _>(|step| recorded.iter().any(|r| r == step.name()));

        Ok(SessionSnapshot {
            in_progress: self.exists(),
            completed: completed.into_iter().map(|s| s.name().to_string()).collect(),
            pending: pending.into_iter().map(|s| s.name().to_string()).collect(),
            loop_device: self.cached_loop_device()?,
        })
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Session state as reported by `build-image status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub in_progress: bool,
    pub completed: Vec<String>,
    pub pending: Vec<String>,
    pub loop_device: Option<LoopDevice>,
}
