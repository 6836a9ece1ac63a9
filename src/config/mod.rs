//! Service configuration.
//!
//! Built-in defaults mirror the original deployment: `png`/`jpg`/`jpeg`/`gif`
//! uploads permitted, the first three compressible, the `imagecomp` tool on
//! PATH, and two concurrent compressions. An optional TOML file overrides
//! any field.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::storage::Layout;

/// Default bound on simultaneous compressions.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Default rescan interval for `run --watch`, in seconds.
pub const DEFAULT_WATCH_INTERVAL_SECONDS: u64 = 1;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,

    #[error("timeout_seconds must be greater than 0 when set")]
    ZeroTimeout,

    #[error("compressible extension {0:?} is not in the permitted set")]
    CompressibleNotPermitted(String),
}

/// Effective service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Root of the storage directory tree.
    pub storage_root: PathBuf,

    /// Extensions accepted at upload (lower-case).
    pub permitted_extensions: Vec<String>,

    /// Permitted extensions that go through the compression queue; everything
    /// else passes straight through to the images directory.
    pub compressible_extensions: Vec<String>,

    /// External compression tool; invoked with the file path as its sole
    /// positional argument and expected to mutate the file in place.
    pub compressor: String,

    /// Upper bound on simultaneous compressions.
    pub max_concurrent: usize,

    /// Optional wall-clock bound per compression; a hung tool counts as a
    /// job error once exceeded. Unset means wait forever, as the original
    /// service did.
    pub timeout_seconds: Option<u64>,

    /// Queue rescan interval for watch mode, in seconds.
    pub watch_interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage"),
            permitted_extensions: vec![
                "png".to_string(),
                "jpg".to_string(),
                "jpeg".to_string(),
                "gif".to_string(),
            ],
            compressible_extensions: vec![
                "png".to_string(),
                "jpg".to_string(),
                "jpeg".to_string(),
            ],
            compressor: "imagecomp".to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            timeout_seconds: None,
            watch_interval_seconds: DEFAULT_WATCH_INTERVAL_SECONDS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for
    /// absent fields.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.timeout_seconds == Some(0) {
            return Err(ConfigError::ZeroTimeout);
        }
        for ext in &self.compressible_extensions {
            if !self.permitted_extensions.iter().any(|p| p == ext) {
                return Err(ConfigError::CompressibleNotPermitted(ext.clone()));
            }
        }
        Ok(())
    }

    /// Directory layout under the configured storage root.
    pub fn layout(&self) -> Layout {
        Layout::new(&self.storage_root)
    }

    pub fn is_permitted(&self, extension: &str) -> bool {
        self.permitted_extensions.iter().any(|e| e == extension)
    }

    pub fn is_compressible(&self, extension: &str) -> bool {
        self.compressible_extensions.iter().any(|e| e == extension)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_seconds)
    }
}
