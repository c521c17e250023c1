//! Build profile loading.
//!
//! A profile is a directory that contributes to a build by convention:
//!
//! | Path | Contribution |
//! |------|--------------|
//! | `config.ini` | `[build]` variables and `[env]` variables (file required) |
//! | `scripts/phase1-host` | host script run before phase 1 target scripts |
//! | `scripts/phase1-target` | script run inside the emulated target |
//! | `scripts/phase2-host` | host script run after phase 1 |
//! | `scripts/phase2-target` | script run inside the emulated target last |
//! | `scripts/extract-image` | turns the download into a raw image on stdout |
//! | `scripts/loop-device-setup` | fixups after the loop device is bound |
//! | `rootfs/` | overlay copied into the target filesystem |
//!
//! Everything but `config.ini` is optional. Presence is probed once when the
//! profile is loaded and recorded in [`ProfileCapabilities`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use configparser::ini::Ini;
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::debug;

use crate::error::{BuildError, Result};

const CONFIG_FILE: &str = "config.ini";
const BUILD_SECTION: &str = "build";
const ENV_SECTION: &str = "env";

/// Script slots run by the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ScriptSlot {
    #[strum(serialize = "phase1 host")]
    Phase1Host,
    #[strum(serialize = "phase1 target")]
    Phase1Target,
    #[strum(serialize = "phase2 host")]
    Phase2Host,
    #[strum(serialize = "phase2 target")]
    Phase2Target,
}

impl ScriptSlot {
    /// Path of this slot's script relative to the profile directory
    pub fn relative_path(self) -> &'static str {
        match self {
            ScriptSlot::Phase1Host => "scripts/phase1-host",
            ScriptSlot::Phase1Target => "scripts/phase1-target",
            ScriptSlot::Phase2Host => "scripts/phase2-host",
            ScriptSlot::Phase2Target => "scripts/phase2-target",
        }
    }

    /// True if scripts in this slot run inside the emulated target
    pub fn runs_in_target(self) -> bool {
        matches!(self, ScriptSlot::Phase1Target | ScriptSlot::Phase2Target)
    }
}

/// Optional files and directories a profile contributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileCapabilities {
    pub phase1_host: Option<PathBuf>,
    pub phase1_target: Option<PathBuf>,
    pub phase2_host: Option<PathBuf>,
    pub phase2_target: Option<PathBuf>,
    pub extract_image: Option<PathBuf>,
    pub loop_device_setup: Option<PathBuf>,
    pub rootfs: Option<PathBuf>,
}

impl ProfileCapabilities {
    /// Probe `dir` for every optional contribution.
    pub fn probe(dir: &Path) -> Self {
        let file = |rel: &str| Some(dir.join(rel)).filter(|p| p.is_file());

        Self {
            phase1_host: file(ScriptSlot::Phase1Host.relative_path()),
            phase1_target: file(ScriptSlot::Phase1Target.relative_path()),
            phase2_host: file(ScriptSlot::Phase2Host.relative_path()),
            phase2_target: file(ScriptSlot::Phase2Target.relative_path()),
            extract_image: file("scripts/extract-image"),
            loop_device_setup: file("scripts/loop-device-setup"),
            rootfs: Some(dir.join("rootfs")).filter(|p| p.is_dir()),
        }
    }

    pub fn script(&self, slot: ScriptSlot) -> Option<&Path> {
        match slot {
            ScriptSlot::Phase1Host => self.phase1_host.as_deref(),
            ScriptSlot::Phase1Target => self.phase1_target.as_deref(),
            ScriptSlot::Phase2Host => self.phase2_host.as_deref(),
            ScriptSlot::Phase2Target => self.phase2_target.as_deref(),
        }
    }
}

/// A loaded profile directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub dir: PathBuf,
    pub build_vars: BTreeMap<String, String>,
    pub env_vars: BTreeMap<String, String>,
    pub capabilities: ProfileCapabilities,
}

impl Profile {
    /// Load the profile rooted at `dir`.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let (build_vars, env_vars) = parse_config(&dir.join(CONFIG_FILE))?;
        let capabilities = ProfileCapabilities::probe(&dir);

        debug!(
            "loaded profile {} ({} build var(s), {} env var(s))",
            dir.display(),
            build_vars.len(),
            env_vars.len()
        );

        Ok(Self {
            dir,
            build_vars,
            env_vars,
            capabilities,
        })
    }
}

/// Parse a profile `config.ini` into its build and environment sections.
///
/// Keys keep their case so environment variable names are exported verbatim.
pub fn parse_config(path: &Path) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>)> {
    let content = fs::read_to_string(path)
        .map_err(|e| BuildError::config(format!("Cannot read {}: {}", path.display(), e)))?;
    parse_config_str(&content, path)
}

fn parse_config_str(
    content: &str,
    origin: &Path,
) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>)> {
    // Only whole-line comments; `;` and `#` inside a value are kept.
    let mut ini = Ini::new_cs();
    ini.set_comment_symbols(&[';', '#']);
    let no_inline: &[char] = &[];
    ini.set_inline_comment_symbols(Some(no_inline));
    let mut sections = ini.read(content.to_string()).map_err(|e| {
        BuildError::config(format!("Failed to parse {} as ini: {}", origin.display(), e))
    })?;

    let mut section = |name: &str| -> BTreeMap<String, String> {
        match sections.remove(name) {
            Some(values) => values
                .into_iter()
                .map(|(key, value)| (key, value.unwrap_or_default()))
                .collect(),
            None => {
                debug!("{} has no [{}] section", origin.display(), name);
                BTreeMap::new()
            }
        }
    };
    let build = section(BUILD_SECTION);
    let env = section(ENV_SECTION);
    Ok((build, env))
}

/// Resolves profile identifiers to directories.
///
/// An identifier is first tried as a filesystem path, then as a name in the
/// built-in catalog directory.
#[derive(Debug, Clone)]
pub struct ProfileResolver {
    catalog_dir: PathBuf,
}

impl ProfileResolver {
    pub fn new(catalog_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog_dir: catalog_dir.into(),
        }
    }

    pub fn catalog_dir(&self) -> &Path {
        &self.catalog_dir
    }

    /// Resolve `id` to a profile directory.
    pub fn resolve(&self, id: &str) -> Result<PathBuf> {
        let literal = PathBuf::from(id);
        if literal.is_dir() {
            return Ok(literal);
        }

        let builtin = self.catalog_dir.join(id);
        if builtin.is_dir() {
            return Ok(builtin);
        }

        Err(BuildError::ProfileNotFound {
            name: id.to_string(),
            searched: format!("./{} and {}", id, builtin.display()),
        })
    }

    /// Resolve and load every profile in order.
    pub fn load_all<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<Profile>> {
        ids.iter()
            .map(|id| {
                let dir = self.resolve(id.as_ref())?;
                debug!("Found profile {}", dir.display());
                Profile::load(dir)
            })
            .collect()
    }

    /// Names of the profiles shipped in the catalog directory.
    pub fn catalog(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.catalog_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.path().join(CONFIG_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// All script slots in pipeline order.
pub fn script_slots() -> impl Iterator<Item = ScriptSlot> {
    ScriptSlot::iter()
}
