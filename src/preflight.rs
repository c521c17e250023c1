//! Pre-flight checks run before any step executes
//!
//! Verifies, in one pass, that the build can proceed:
//! - Running with root privileges (EUID 0), unless explicitly skipped
//! - Some profile provides `extract-image` and `loop-device-setup`
//! - Every required build variable is defined and well-formed
//! - Required host commands are on PATH
//!
//! Every violation is collected so the operator can fix them all at once.

use tracing::debug;

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};

/// Host commands the pipeline invokes.
pub const REQUIRED_COMMANDS: &[&str] = &[
    "bash", "cut", "df", "grep", "losetup", "mount", "parted", "partx", "pv", "rsync",
    "truncate", "umount", "wget",
];

/// Environment variable that disables the root check, as `--skip-root-check` does.
pub const SKIP_ROOT_CHECK_ENV: &str = "IMAGE_BUILDER_SKIP_ROOT_CHECK";

/// Collected pre-flight violations.
#[derive(Debug, Default)]
pub struct PreflightReport {
    violations: Vec<String>,
}

impl PreflightReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    fn push(&mut self, violation: impl Into<String>) {
        self.violations.push(violation.into());
    }

    /// Check the merged profile configuration.
    pub fn check_config(&mut self, config: &BuildConfig) {
        if config.extract_image().is_none() {
            self.push("no profile provides an extract-image script");
        }
        if config.loop_device_setup().is_none() {
            self.push("no profile provides a loop-device-setup script");
        }

        let missing = config.missing_required_variables();
        for var in &missing {
            self.push(format!(
                "variable {} is not defined in any profiles but is required",
                var
            ));
        }
        // Shape errors are only meaningful once every variable exists
        if missing.is_empty() {
            if let Err(e) = config.image_settings() {
                self.push(e.to_string());
            }
        }
    }

    /// Check privileges and host commands; `emulator` is the command that
    /// runs target scripts.
    pub fn check_host(&mut self, skip_root_check: bool, emulator: &str) {
        if skip_root_check {
            debug!("root check skipped");
        } else if !is_running_as_root() {
            self.push("the builder must run as root (EUID 0)");
        }

        for command in REQUIRED_COMMANDS.iter().copied().chain([emulator]) {
            if !command_exists(command) {
                self.push(format!("required command not found on PATH: {}", command));
            }
        }
    }

    /// `Ok` if nothing was violated, else a precondition error listing all.
    pub fn into_result(self) -> Result<()> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Precondition(self.violations))
        }
    }
}

/// Run every check against `config` and the current host.
pub fn verify(config: &BuildConfig, skip_root_check: bool, emulator: &str) -> Result<()> {
    let mut report = PreflightReport::default();
    report.check_config(config);
    report.check_host(skip_root_check || skip_root_check_from_env(), emulator);
    report.into_result()
}

/// True if the skip-root-check environment variable is set to `1` or `true`.
pub fn skip_root_check_from_env() -> bool {
    std::env::var(SKIP_ROOT_CHECK_ENV)
        .map(|v| matches!(v.trim(), "1" | "true"))
        .unwrap_or(false)
}

fn command_exists(name: &str) -> bool {
    which::which(name).is_ok()
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}
