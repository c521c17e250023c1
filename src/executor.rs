//! Host and target command execution.
//!
//! All external processes started by a build go through [`ScriptExecutor`]:
//!
//! - Children run in their own process group and are registered with the
//!   build's [`ChildRegistry`](crate::process_guard::ChildRegistry)
//! - Every child sees the host environment overlaid with the merged profile
//!   environment
//! - A non-zero exit is an error; nothing is retried
//!
//! Target scripts are staged into the chroot's scratch directory and run via
//! the emulated-execution wrapper (`systemd-nspawn` by default). The staged
//! copy is removed whether or not the script succeeds.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::{debug, warn};

use crate::error::{BuildError, CommandStatus, Result};
use crate::process_guard::{CommandProcessGroup, SharedRegistry};
use crate::tools::ToolArgs;

/// Scratch directory inside the chroot for staged target scripts.
pub const TARGET_SCRATCH_DIR: &str = "setup";

/// Shell used for pipelines; `pipefail` makes a failing stage fail the pipeline.
const SHELL: &str = "bash";

/// A command to run on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// Execute a program directly with an argument vector.
    Argv {
        program: OsString,
        args: Vec<OsString>,
    },
    /// Run `script` with `bash -o pipefail -c`. `args` become `$1`, `$2`, ...
    /// so paths never need shell quoting.
    Shell { script: String, args: Vec<OsString> },
}

impl HostCommand {
    pub fn argv<I, S>(program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self::Argv {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shell<I, S>(script: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self::Shell {
            script: script.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn to_command(&self) -> Command {
        match self {
            HostCommand::Argv { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            HostCommand::Shell { script, args } => {
                let mut cmd = Command::new(SHELL);
                // The word after the script is $0
                cmd.args(["-o", "pipefail", "-c", script.as_str(), SHELL])
                    .args(args);
                cmd
            }
        }
    }

    /// Command line for logs and error messages
    pub fn display(&self) -> String {
        let join = |args: &[OsString]| {
            args.iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        };
        match self {
            HostCommand::Argv { program, args } if args.is_empty() => {
                program.to_string_lossy().into_owned()
            }
            HostCommand::Argv { program, args } => {
                format!("{} {}", program.to_string_lossy(), join(args))
            }
            HostCommand::Shell { script, args } if args.is_empty() => script.clone(),
            HostCommand::Shell { script, args } => format!("{} [{}]", script, join(args)),
        }
    }
}

/// Runs host commands and target scripts with the build environment.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    env: BTreeMap<String, String>,
    chroot_path: PathBuf,
    emulator: String,
    registry: SharedRegistry,
}

impl ScriptExecutor {
    /// `emulator` is the emulated-execution wrapper invoked as
    /// `<emulator> -D <chroot_path> env K=V... <script> [args]`.
    pub fn new(
        env: BTreeMap<String, String>,
        chroot_path: impl Into<PathBuf>,
        emulator: impl Into<String>,
        registry: SharedRegistry,
    ) -> Self {
        Self {
            env,
            chroot_path: chroot_path.into(),
            emulator: emulator.into(),
            registry,
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn chroot_path(&self) -> &Path {
        &self.chroot_path
    }

    /// Run a host command with inherited stdout/stderr.
    ///
    /// # Errors
    ///
    /// `Spawn` if it cannot start, `Command` if it exits unsuccessfully.
    pub fn run_host(&self, command: &HostCommand) -> Result<()> {
        let line = command.display();
        debug!("running {} with env {:?}", line, self.env);

        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null());
        let status = self.wait(self.spawn(&mut cmd, &line)?, &line)?;
        check_status(status, &line)
    }

    /// Run a typed tool invocation on the host.
    pub fn run_tool<T: ToolArgs>(&self, tool: &T) -> Result<()> {
        self.run_host(&HostCommand::argv(tool.program(), tool.to_cli_args()))
    }

    /// Run a typed tool invocation and return its stdout.
    pub fn capture_tool<T: ToolArgs>(&self, tool: &T) -> Result<String> {
        let line = tool.display();
        debug!("running {} (capturing output)", line);

        let mut cmd = Command::new(tool.program());
        cmd.args(tool.to_cli_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped());
        let child = self.spawn(&mut cmd, &line)?;
        let pid = child.id();
        let output = child.wait_with_output();
        self.unregister(pid);

        let output = output.map_err(|source| BuildError::Spawn {
            command: line.clone(),
            source,
        })?;
        check_status(output.status, &line)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a profile script on the host.
    pub fn run_script_on_host(&self, script: &Path, args: &[String]) -> Result<()> {
        self.run_host(&HostCommand::argv(script, args.iter().map(OsString::from)))
    }

    /// Stage `script` into the chroot and run it in the emulated target.
    ///
    /// The script sees every merged environment variable. The staged copy is
    /// removed afterwards even if the script fails.
    pub fn run_script_on_target(&self, script: &Path, args: &[String]) -> Result<()> {
        let staged = StagedScript::stage(script, &self.chroot_path)?;
        let command = HostCommand::argv(&self.emulator, self.target_args(&staged, args));
        debug!("running {} in the target", command.display());
        self.run_host(&command)
    }

    fn target_args(&self, staged: &StagedScript, args: &[String]) -> Vec<OsString> {
        let mut argv: Vec<OsString> = vec!["-D".into(), self.chroot_path.clone().into()];
        // `env` merges our variables into the container's default environment
        argv.push("env".into());
        argv.extend(self.env.iter().map(|(k, v)| OsString::from(format!("{}={}", k, v))));
        argv.push(staged.path_in_target().into());
        argv.extend(args.iter().map(OsString::from));
        argv
    }

    fn spawn(&self, cmd: &mut Command, line: &str) -> Result<Child> {
        cmd.envs(&self.env).in_new_process_group();
        let child = cmd.spawn().map_err(|source| BuildError::Spawn {
            command: line.to_string(),
            source,
        })?;

        if let Ok(mut registry) = self.registry.lock() {
            registry.register(child.id());
        }
        Ok(child)
    }

    fn wait(&self, mut child: Child, line: &str) -> Result<ExitStatus> {
        let pid = child.id();
        let status = child.wait();
        self.unregister(pid);
        status.map_err(|source| BuildError::Spawn {
            command: line.to_string(),
            source,
        })
    }

    fn unregister(&self, pid: u32) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.unregister(pid);
        }
    }
}

fn check_status(status: ExitStatus, line: &str) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let status = match status.code() {
        Some(code) => CommandStatus::Exit(code),
        None => CommandStatus::Signal,
    };
    Err(BuildError::Command {
        command: line.to_string(),
        status,
    })
}

/// A script copied into the chroot scratch directory, removed on drop.
#[derive(Debug)]
pub struct StagedScript {
    host_path: PathBuf,
    file_name: String,
}

impl StagedScript {
    /// Copy `script` to `<chroot>/setup/<name>`, keeping its permissions.
    pub fn stage(script: &Path, chroot_path: &Path) -> Result<Self> {
        let file_name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BuildError::config(format!("{} is not a script file", script.display()))
            })?;
        let host_path = chroot_path.join(TARGET_SCRATCH_DIR).join(&file_name);

        debug!("copying {} to {}", script.display(), host_path.display());
        fs::copy(script, &host_path)?;
        Ok(Self {
            host_path,
            file_name,
        })
    }

    /// Location of the staged copy on the host.
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    /// Location of the staged copy as seen from inside the target.
    pub fn path_in_target(&self) -> String {
        format!("/{}/{}", TARGET_SCRATCH_DIR, self.file_name)
    }
}

impl Drop for StagedScript {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.host_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove staged script {}: {}",
                    self.host_path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_guard::ProcessGuard;
    use tempfile::TempDir;

    fn executor(env: &[(&str, &str)], chroot: &Path, guard: &ProcessGuard) -> ScriptExecutor {
        ScriptExecutor::new(
            env.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            chroot,
            "systemd-nspawn",
            guard.registry(),
        )
    }

    #[test]
    fn test_shell_command_uses_pipefail_and_positional_args() {
        let cmd = HostCommand::shell("\"$1\" | pv > \"$2\"", ["a b.xz", "out.img"]);
        let command = cmd.to_command();
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(command.get_program(), "bash");
        assert_eq!(
            args,
            vec!["-o", "pipefail", "-c", "\"$1\" | pv > \"$2\"", "bash", "a b.xz", "out.img"]
        );
    }

    #[test]
    fn test_host_command_failure_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let guard = ProcessGuard::new();
        let exec = executor(&[], dir.path(), &guard);

        let err = exec
            .run_host(&HostCommand::shell("exit 3", Vec::<String>::new()))
            .unwrap_err();
        match err {
            BuildError::Command { status, .. } => assert_eq!(status, CommandStatus::Exit(3)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(guard.child_count(), 0);
    }

    #[test]
    fn test_pipefail_catches_early_stage_failure() {
        let dir = TempDir::new().unwrap();
        let guard = ProcessGuard::new();
        let exec = executor(&[], dir.path(), &guard);

        let result = exec.run_host(&HostCommand::shell("false | cat", Vec::<String>::new()));
        assert!(matches!(result, Err(BuildError::Command { .. })));
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let guard = ProcessGuard::new();
        let exec = executor(&[], dir.path(), &guard);

        let result = exec.run_host(&HostCommand::argv(
            "definitely_not_a_real_command_12345",
            Vec::<String>::new(),
        ));
        assert!(matches!(result, Err(BuildError::Spawn { .. })));
    }

    #[test]
    fn test_environment_is_overlaid_on_host_env() {
        let dir = TempDir::new().unwrap();
        let guard = ProcessGuard::new();
        let out = dir.path().join("env.txt");
        let exec = executor(&[("ROS_DISTRO", "humble")], dir.path(), &guard);

        // PATH still resolves `printf` because the host environment is inherited
        exec.run_host(&HostCommand::shell(
            "printf '%s' \"$ROS_DISTRO\" > \"$1\"",
            [out.as_os_str()],
        ))
        .unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap(), "humble");
    }

    #[test]
    fn test_target_args_layout() {
        let dir = TempDir::new().unwrap();
        let guard = ProcessGuard::new();
        fs::create_dir(dir.path().join(TARGET_SCRATCH_DIR)).unwrap();
        let script = dir.path().join("phase1-target");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        let exec = executor(&[("A", "1"), ("B", "two")], dir.path(), &guard);

        let staged = StagedScript::stage(&script, dir.path()).unwrap();
        let args: Vec<String> = exec
            .target_args(&staged, &["--flag".to_string()])
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(
            args,
            vec![
                "-D".to_string(),
                dir.path().display().to_string(),
                "env".to_string(),
                "A=1".to_string(),
                "B=two".to_string(),
                "/setup/phase1-target".to_string(),
                "--flag".to_string(),
            ]
        );
    }

    #[test]
    fn test_staged_script_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(TARGET_SCRATCH_DIR)).unwrap();
        let script = dir.path().join("phase2-target");
        fs::write(&script, "#!/bin/sh\n").unwrap();

        let staged = StagedScript::stage(&script, dir.path()).unwrap();
        let staged_path = staged.host_path().to_path_buf();
        assert!(staged_path.is_file());
        assert_eq!(staged.path_in_target(), "/setup/phase2-target");

        drop(staged);
        assert!(!staged_path.exists());
    }

    #[test]
    fn test_capture_tool_returns_stdout() {
        struct Echo;
        impl ToolArgs for Echo {
            fn program(&self) -> &'static str {
                "echo"
            }
            fn to_cli_args(&self) -> Vec<OsString> {
                vec!["/dev/loop9".into()]
            }
        }

        let dir = TempDir::new().unwrap();
        let guard = ProcessGuard::new();
        let exec = executor(&[], dir.path(), &guard);

        assert_eq!(exec.capture_tool(&Echo).unwrap().trim(), "/dev/loop9");
    }

    #[test]
    fn test_failed_capture_names_command_line() {
        struct Sh;
        impl ToolArgs for Sh {
            fn program(&self) -> &'static str {
                "sh"
            }
            fn to_cli_args(&self) -> Vec<OsString> {
                vec!["-c".into(), "exit 4".into()]
            }
        }

        let dir = TempDir::new().unwrap();
        let guard = ProcessGuard::new();
        let exec = executor(&[], dir.path(), &guard);

        match exec.capture_tool(&Sh).unwrap_err() {
            BuildError::Command { command, status } => {
                assert_eq!(command, Sh.display());
                assert_eq!(status, CommandStatus::Exit(4));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(guard.child_count(), 0);
    }
}
