//! Session defaults file.
//!
//! `.ktest.toml` pre-sets any CLI field; explicit flags always win.
//! `KTEST_CONFIG` points at an alternate file, `KTEST_NO_CONFIG=1`
//! skips loading entirely. The implicit lookup tries the working
//! directory and then the home directory, and a missing implicit file
//! is not an error.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Environment variable selecting an explicit config path.
pub const CONFIG_ENV: &str = "KTEST_CONFIG";
/// Environment variable disabling config loading.
pub const NO_CONFIG_ENV: &str = "KTEST_NO_CONFIG";
/// Default config file name.
pub const CONFIG_FILE: &str = ".ktest.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Optional defaults for every session field the CLI exposes.
///
/// String-typed fields (`disks`, `nets`, `mounts`, `includes`,
/// `crashdrive_size`) use the same syntax as the corresponding flags
/// and are parsed after merging.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub uri: Option<String>,
    pub pool: Option<String>,
    pub owner: Option<String>,
    pub memory_mib: Option<u64>,
    pub vcpus: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub kdump_timeout_secs: Option<u64>,
    pub crashdrive_size: Option<String>,
    pub disable_kdump: Option<bool>,
    pub disable_console: Option<bool>,
    pub clean: Option<bool>,
    pub kernel_opts: Option<Vec<String>>,
    pub entry_point: Option<String>,
    pub gdb: Option<String>,
    pub modules: Option<Vec<String>>,
    pub programs: Option<Vec<PathBuf>>,
    pub includes: Option<Vec<String>>,
    pub mounts: Option<Vec<String>>,
    pub disks: Option<Vec<String>>,
    pub nets: Option<Vec<String>>,
    pub kmoddir: Option<PathBuf>,
    pub fwdir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl FileConfig {
    /// Load defaults according to the environment.
    ///
    /// An explicit `KTEST_CONFIG` path must exist and parse; the
    /// implicit `.ktest.toml` lookup returns empty defaults when no
    /// file is found.
    pub fn load() -> Result<Self, ConfigError> {
        if std::env::var_os(NO_CONFIG_ENV).is_some() {
            debug!("Config loading disabled via {NO_CONFIG_ENV}");
            return Ok(Self::default());
        }
        if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from(Path::new(&explicit));
        }
        for candidate in Self::implicit_candidates() {
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }
        Ok(Self::default())
    }

    /// Parse one specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded session defaults");
        Ok(config)
    }

    fn implicit_candidates() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(Path::new(&home).join(CONFIG_FILE));
        }
        candidates
    }
}
