//! Configuration for a synchronization deployment.
//!
//! Loaded from TOML. Every field has a default so an empty file is a
//! valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Root directory of the source registry.
    pub registry_root: PathBuf,
    /// Location scope of every pass, e.g. `/project`. Matches whole segments.
    pub scope: String,
    /// JSON file holding persisted artefacts. In-memory only when unset.
    pub state_file: Option<PathBuf>,
    /// Interval between scheduled passes.
    pub interval_secs: u64,
    /// Upper bound for a single `apply` call.
    pub apply_timeout_ms: u64,
    /// Maximum applies dispatched concurrently within one depletion iteration.
    pub max_concurrent_applies: usize,
    /// Consecutive failed passes before the scheduled loop gives up.
    pub max_consecutive_errors: usize,
    /// Stop the scheduled loop on the first failed pass.
    pub stop_on_error: bool,
    /// User recorded in the audit fields of persisted artefacts.
    pub actor: String,
    /// Document synchronizers to register, in registration order.
    pub synchronizers: Vec<SynchronizerEntry>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            registry_root: PathBuf::from("registry"),
            scope: "/".to_string(),
            state_file: None,
            interval_secs: 10,
            apply_timeout_ms: 30_000,
            max_concurrent_applies: 8,
            max_consecutive_errors: 10,
            stop_on_error: false,
            actor: "system".to_string(),
            synchronizers: Vec::new(),
        }
    }
}

/// One registered document synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynchronizerEntry {
    /// Artefact type tag, e.g. `role`.
    pub artefact_type: String,
    /// File extension without the dot. Defaults to the artefact type.
    #[serde(default)]
    pub extension: Option<String>,
    /// Whether artefacts of this type take part in START/STOP.
    #[serde(default)]
    pub supports_start_stop: bool,
}

impl SynchronizerEntry {
    /// Effective file extension.
    pub fn extension(&self) -> &str {
        self.extension.as_deref().unwrap_or(&self.artefact_type)
    }
}

impl SyncConfig {
    /// Parse a configuration from TOML text and validate it.
    ///
    /// # Errors
    ///
    /// Returns `TomlParseFailed` for malformed TOML and `InvalidConfig`
    /// when a value is out of range.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the file cannot be read, otherwise the
    /// errors of [`SyncConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges and synchronizer uniqueness.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !self.scope.starts_with('/') {
            return Err(Error::invalid_config("scope", "must start with '/'"));
        }
        if self.interval_secs == 0 {
            return Err(Error::invalid_config("interval_secs", "must be greater than zero"));
        }
        if self.apply_timeout_ms == 0 {
            return Err(Error::invalid_config(
                "apply_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.max_concurrent_applies == 0 {
            return Err(Error::invalid_config(
                "max_concurrent_applies",
                "must be greater than zero",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.synchronizers {
            if entry.artefact_type.trim().is_empty() {
                return Err(Error::invalid_config(
                    "synchronizers.artefact_type",
                    "must not be empty",
                ));
            }
            if !seen.insert(entry.extension().to_string()) {
                return Err(Error::invalid_config(
                    "synchronizers.extension",
                    format!("extension '{}' is registered twice", entry.extension()),
                ));
            }
        }
        Ok(())
    }

    /// Interval between scheduled passes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Timeout for a single apply.
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }
}
