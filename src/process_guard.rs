//! Process lifecycle management for child processes
//!
//! Every tool and profile script the builder runs is spawned in its own
//! process group and tracked in a [`ChildRegistry`]. If the builder is
//! interrupted (SIGINT, SIGTERM, SIGHUP) or unwinds, the tracked groups are
//! terminated so that no `parted` or target script keeps mutating the image
//! behind an exited builder.
//!
//! Mounts and the loop device are deliberately left alone: the session record
//! says which steps completed, and re-running the build resumes from there.
//!
//! - Children get SIGTERM, then SIGKILL after a grace period
//! - Children also receive SIGTERM if the builder dies without cleanup
//!   (parent-death signal)

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Shared handle to a registry.
pub type SharedRegistry = Arc<Mutex<ChildRegistry>>;

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// Set of child PIDs currently running
    pids: HashSet<u32>,
    /// Whether cleanup has already been initiated (prevent double-cleanup)
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Register a new child process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Registered child process PID {}", pid);
    }

    /// Unregister a child process (called when it exits normally)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Unregistered child process PID {}", pid);
    }

    /// Get count of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked child processes
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("Cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            debug!("No child processes to terminate");
            return;
        }

        info!("Terminating {} child process(es)...", self.pids.len());

        // Signal whole groups so e.g. the `pv` and extractor in a pipeline both stop
        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to PID {}: {}", pid, e2);
                }
            } else {
                debug!("Sent SIGTERM to process group {}", pid);
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            let still_alive = pids_to_kill.iter().any(|&pid| is_process_alive(pid));
            if !still_alive {
                info!("All child processes terminated gracefully");
                self.pids.clear();
                return;
            }

            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                warn!("Process group {} did not terminate, sending SIGKILL", pid);
                if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
                    error!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.pids.clear();
        info!("Child process cleanup complete");
    }
}

/// Send a signal to a process
fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Send a signal to an entire process group (negative PID)
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie)
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/pid/stat is the state; zombies count as dead
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// RAII guard that terminates all registered children on drop.
///
/// The builder owns one guard for its lifetime and hands clones of
/// [`ProcessGuard::registry`] to whatever spawns processes.
#[derive(Debug)]
pub struct ProcessGuard {
    registry: SharedRegistry,
}

impl ProcessGuard {
    /// Create a guard with a fresh, empty registry
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(ChildRegistry::default())),
        }
    }

    /// Shared handle to the guarded registry
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Get the number of tracked children
    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        debug!("ProcessGuard dropped, initiating cleanup");
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

/// Install handlers for SIGINT (Ctrl+C), SIGTERM and SIGHUP that terminate
/// the children tracked in `registry` and exit with 128 + signal.
///
/// Call once at program start.
pub fn init_signal_handlers(registry: SharedRegistry) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            warn!(
                "Received {}, stopping child processes; mounts and loop device stay allocated, re-run to resume",
                signal_name
            );

            if let Ok(mut registry) = registry.lock() {
                registry.terminate_all(Duration::from_secs(3));
            }

            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command in its own process group and deliver SIGTERM to it if
    /// the builder dies
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions
        // (setpgid, prctl) between fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    /// Helper to wait for a process to terminate (reap zombie)
    fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
        use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};

        let start = Instant::now();
        let nix_pid = Pid::from_raw(pid as i32);

        while start.elapsed() < timeout {
            match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                    return true;
                }
                Ok(WaitStatus::StillAlive) => {}
                Err(nix::errno::Errno::ECHILD) => {
                    if !is_process_alive(pid) {
                        return true;
                    }
                }
                _ => {}
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = ChildRegistry::default();

        registry.register(1234);
        registry.register(5678);
        assert_eq!(registry.count(), 2);

        registry.unregister(1234);
        assert_eq!(registry.count(), 1);

        registry.unregister(5678);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_guards_do_not_share_registries() {
        let first = ProcessGuard::new();
        let second = ProcessGuard::new();

        first.registry().lock().unwrap().register(1111);

        assert_eq!(first.child_count(), 1);
        assert_eq!(second.child_count(), 0);

        first.registry().lock().unwrap().unregister(1111);
        assert_eq!(first.child_count(), 0);
    }

    #[test]
    fn test_terminate_all_kills_process_group() {
        let child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn sleep process");
        let pid = child.id();

        let mut registry = ChildRegistry::default();
        registry.register(pid);
        assert!(is_process_alive(pid), "Process should be alive after spawn");

        registry.terminate_all(Duration::from_millis(500));

        assert!(
            wait_for_process_death(pid, Duration::from_secs(2)),
            "Process should be dead after terminate_all"
        );
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_terminate_all_handles_already_dead_process() {
        let mut child = Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .expect("Failed to spawn sh");
        let pid = child.id();
        let _ = child.wait();

        let mut registry = ChildRegistry::default();
        registry.register(pid);

        registry.terminate_all(Duration::from_millis(100));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_cleanup_initiated_flag_prevents_double_cleanup() {
        let mut registry = ChildRegistry::default();
        registry.register(999_999);

        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.cleanup_initiated);

        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.cleanup_initiated);
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999));
    }
}
