//! Error handling for the image builder.
//!
//! Every fallible operation in the library returns [`BuildError`]. The variants
//! follow the failure classes of a build: problems detected before anything
//! destructive happens (profiles, configuration, preconditions), failures of
//! the external tools the pipeline drives, the operator declining a pause
//! point, and ordering violations on session-held resources.

use std::fmt;

use thiserror::Error;

/// Main error type for the image builder
#[derive(Error, Debug)]
pub enum BuildError {
    /// A profile identifier resolved neither as a path nor in the built-in catalog
    #[error("Cannot find profile {name} (looked in {searched})")]
    ProfileNotFound { name: String, searched: String },

    /// Configuration errors (missing config.ini, missing section, bad value)
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more preconditions failed before any step ran
    #[error("Build cannot proceed:\n{}", format_violations(.0))]
    Precondition(Vec<String>),

    /// An external command exited unsuccessfully
    #[error("Command `{command}` failed ({status})")]
    Command {
        command: String,
        status: CommandStatus,
    },

    /// An external command could not be started at all
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The operator declined to continue at a pause point
    #[error("Build paused after {step} and not continued by the operator")]
    OperatorAbort { step: String },

    /// Session-held state is missing or inconsistent (step ordering violation)
    #[error("Resource state error: {0}")]
    ResourceState(String),

    /// IO errors (session files, chroot file shuffling, staging)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How an external command ended when it did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Exited with a non-zero code
    Exit(i32),
    /// Terminated by a signal
    Signal,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Exit(code) => write!(f, "exit code {}", code),
            CommandStatus::Signal => write!(f, "terminated by signal"),
        }
    }
}

fn format_violations(violations: &[String]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type alias for image builder operations
pub type Result<T> = std::result::Result<T, BuildError>;

impl BuildError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a resource state error
    pub fn resource_state(msg: impl Into<String>) -> Self {
        Self::ResourceState(msg.into())
    }

    /// True if this error is the operator declining a pause point.
    pub fn is_operator_abort(&self) -> bool {
        matches!(self, Self::OperatorAbort { .. })
    }
}
