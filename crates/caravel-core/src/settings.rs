//! Ambient configuration for fetching and caching.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunable settings for network operations and the on-disk cache.
///
/// Loaded from `<config dir>/caravel/config.toml` when present, otherwise
/// defaulted. Every field is optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory for the module cache. Defaults to
    /// `<cache dir>/caravel/modules`.
    pub cache_dir: Option<PathBuf>,
    /// Deadline for a single network operation, in seconds.
    pub timeout_secs: u64,
    /// Total attempts for a retryable registry request.
    pub retry_attempts: u32,
    /// Maximum concurrent layer downloads for one artifact.
    pub layer_concurrency: usize,
    /// Entry-file extension filter (without the dot). When unset, every
    /// non-hidden regular file in a package counts as an entry file.
    pub entry_extension: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: None,
            timeout_secs: 120,
            retry_attempts: 3,
            layer_concurrency: 4,
            entry_extension: None,
        }
    }
}

impl Settings {
    /// Load settings from the user config file, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self> {
        let Some(path) = Self::config_file() else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("failed to read settings file {}", path.display()), e))?;
        toml::from_str(&raw).map_err(|e| Error::Settings {
            path,
            message: e.to_string(),
        })
    }

    /// Path of the optional settings file, if a config dir exists.
    fn config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("caravel").join("config.toml"))
    }

    /// Effective cache root directory.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("caravel")
                .join("modules")
        })
    }
}
