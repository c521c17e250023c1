//! Type-safe argument contracts for external host tools.
//!
//! The pipeline delegates partitioning, loop devices, mounting and copying to
//! installed utilities. Each invocation is a struct implementing [`ToolArgs`],
//! so the exact flags passed to a tool live in one place and are covered by
//! tests instead of being scattered string vectors.
//!
//! # Contract
//!
//! - `program()`: the executable name, resolved on `PATH` at execution time.
//! - `to_cli_args()`: the arguments exactly as the tool expects them.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

/// Trait for typed tool arguments.
pub trait ToolArgs {
    /// Executable name (e.g. `"losetup"`).
    fn program(&self) -> &'static str;

    /// Arguments passed to the executable, in order.
    fn to_cli_args(&self) -> Vec<OsString>;

    /// Human-readable command line for logs and error messages.
    fn display(&self) -> String {
        let mut line = self.program().to_string();
        for arg in self.to_cli_args() {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

fn os(s: impl AsRef<OsStr>) -> OsString {
    s.as_ref().to_os_string()
}

/// `wget` download with coarse dot progress (one dot per 10M).
#[derive(Debug, Clone)]
pub struct WgetArgs {
    pub url: String,
    pub output: PathBuf,
}

impl ToolArgs for WgetArgs {
    fn program(&self) -> &'static str {
        "wget"
    }

    fn to_cli_args(&self) -> Vec<OsString> {
        vec![
            os("--progress=dot"),
            os("-e"),
            os("dotbytes=10M"),
            os("-O"),
            os(&self.output),
            os(&self.url),
        ]
    }
}

/// `truncate -s <size> <path>`: grow (or shrink) a file to `size`.
#[derive(Debug, Clone)]
pub struct TruncateArgs {
    /// Size in `truncate` syntax, e.g. `4G`
    pub size: String,
    pub path: PathBuf,
}

impl ToolArgs for TruncateArgs {
    fn program(&self) -> &'static str {
        "truncate"
    }

    fn to_cli_args(&self) -> Vec<OsString> {
        vec![os("-s"), os(&self.size), os(&self.path)]
    }
}

/// `partx -g <image>`: one line per partition, no header.
#[derive(Debug, Clone)]
pub struct PartxListArgs {
    pub image: PathBuf,
}

impl ToolArgs for PartxListArgs {
    fn program(&self) -> &'static str {
        "partx"
    }

    fn to_cli_args(&self) -> Vec<OsString> {
        vec![os("-g"), os(&self.image)]
    }
}

/// `parted <image> resizepart <n> <end>`, end in megabytes.
#[derive(Debug, Clone)]
pub struct PartedResizeArgs {
    pub image: PathBuf,
    /// 1-based partition number
    pub partition: usize,
    pub end_mb: u64,
}

impl ToolArgs for PartedResizeArgs {
    fn program(&self) -> &'static str {
        "parted"
    }

    fn to_cli_args(&self) -> Vec<OsString> {
        vec![
            os(&self.image),
            os("resizepart"),
            os(self.partition.to_string()),
            os(self.end_mb.to_string()),
        ]
    }
}

/// `losetup -P --show -f <image>`: bind to the first free loop device with
/// partition scanning and print the device path.
#[derive(Debug, Clone)]
pub struct LosetupAttachArgs {
    pub image: PathBuf,
}

impl ToolArgs for LosetupAttachArgs {
    fn program(&self) -> &'static str {
        "losetup"
    }

    fn to_cli_args(&self) -> Vec<OsString> {
        vec![os("-P"), os("--show"), os("-f"), os(&self.image)]
    }
}

/// `losetup -d <device>`
#[derive(Debug, Clone)]
pub struct LosetupDetachArgs {
    pub device: PathBuf,
}

impl ToolArgs for LosetupDetachArgs {
    fn program(&self) -> &'static str {
        "losetup"
    }

    fn to_cli_args(&self) -> Vec<OsString> {
        vec![os("-d"), os(&self.device)]
    }
}

/// `mount <device> <target>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArgs {
    pub device: PathBuf,
    pub target: PathBuf,
}

impl ToolArgs for MountArgs {
    fn program(&self) -> &'static str {
        "mount"
    }

    fn to_cli_args(&self) -> Vec<OsString> {
        vec![os(&self.device), os(&self.target)]
    }
}

/// `umount -R <target>`: unmount `target` and everything below it.
#[derive(Debug, Clone)]
pub struct UmountRecursiveArgs {
    pub target: PathBuf,
}

impl ToolArgs for UmountRecursiveArgs {
    fn program(&self) -> &'static str {
        "umount"
    }

    fn to_cli_args(&self) -> Vec<OsString> {
        vec![os("-R"), os(&self.target)]
    }
}

/// `rsync` of an overlay directory's contents into the chroot, owned by root.
#[derive(Debug, Clone)]
pub struct RsyncOverlayArgs {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl ToolArgs for RsyncOverlayArgs {
    fn program(&self) -> &'static str {
        "rsync"
    }

    fn to_cli_args(&self) -> Vec<OsString> {
        // Trailing slash: copy the directory's contents, not the directory
        let mut source = os(&self.source);
        source.push("/");
        vec![
            os("-r"),
            os("-og"),
            os("--chown"),
            os("root:root"),
            os("--stats"),
            source,
            os(&self.destination),
        ]
    }
}

/// `df -h <path>`
#[derive(Debug, Clone)]
pub struct DiskUsageArgs {
    pub path: PathBuf,
}

impl ToolArgs for DiskUsageArgs {
    fn program(&self) -> &'static str {
        "df"
    }

    fn to_cli_args(&self) -> Vec<OsString> {
        vec![os("-h"), os(&self.path)]
    }
}
