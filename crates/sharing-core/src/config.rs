//! Configuration for the sharing replication engine.

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_FILES_DOCTYPE: &str = "io.cozy.files";
pub const DEFAULT_SHARED_DOCTYPE: &str = "io.cozy.shared";

/// Engine configuration.
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingConfig {
    /// Doctype holding file and directory records
    #[serde(default = "default_files_doctype")]
    pub files_doctype: String,

    /// Doctype holding the known revisions of shared documents
    #[serde(default = "default_shared_doctype")]
    pub shared_doctype: String,

    /// Number of random bytes in a generated revision hash
    #[serde(default = "default_rev_hash_bytes")]
    pub rev_hash_bytes: usize,

    /// How many suffixed names to try when a replicated name collides locally
    #[serde(default = "default_max_conflict_renames")]
    pub max_conflict_renames: u32,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            files_doctype: default_files_doctype(),
            shared_doctype: default_shared_doctype(),
            rev_hash_bytes: default_rev_hash_bytes(),
            max_conflict_renames: default_max_conflict_renames(),
        }
    }
}

fn default_files_doctype() -> String {
    DEFAULT_FILES_DOCTYPE.to_string()
}

fn default_shared_doctype() -> String {
    DEFAULT_SHARED_DOCTYPE.to_string()
}

fn default_rev_hash_bytes() -> usize {
    16
}

fn default_max_conflict_renames() -> u32 {
    32
}

impl SharingConfig {
    /// Parse a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()
    }

    /// Load a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&contents)
    }

    /// Load configuration from environment variables, with defaults.
    ///
    /// Recognized variables:
    /// - `SHARING_FILES_DOCTYPE`
    /// - `SHARING_SHARED_DOCTYPE`
    /// - `SHARING_REV_HASH_BYTES`
    /// - `SHARING_MAX_CONFLICT_RENAMES`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = var("SHARING_FILES_DOCTYPE") {
            config.files_doctype = v;
        }
        if let Some(v) = var("SHARING_SHARED_DOCTYPE") {
            config.shared_doctype = v;
        }
        if let Some(v) = var("SHARING_REV_HASH_BYTES") {
            config.rev_hash_bytes = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SHARING_REV_HASH_BYTES",
                value: v,
            })?;
        }
        if let Some(v) = var("SHARING_MAX_CONFLICT_RENAMES") {
            config.max_conflict_renames = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SHARING_MAX_CONFLICT_RENAMES",
                value: v,
            })?;
        }
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.files_doctype.is_empty() || self.shared_doctype.is_empty() {
            return Err(ConfigError::EmptyDoctype);
        }
        if self.files_doctype == self.shared_doctype {
            return Err(ConfigError::SameDoctype(self.files_doctype));
        }
        if self.rev_hash_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "rev_hash_bytes",
                value: "0".to_string(),
            });
        }
        Ok(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {message}")]
    Read { path: String, message: String },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Doctypes must not be empty")]
    EmptyDoctype,

    #[error("Files and shared records cannot use the same doctype: {0}")]
    SameDoctype(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = SharingConfig::from_json("{}").unwrap();
        assert_eq!(config, SharingConfig::default());
        assert_eq!(config.files_doctype, "io.cozy.files");
        assert_eq!(config.rev_hash_bytes, 16);
    }

    #[test]
    fn test_partial_json() {
        let config = SharingConfig::from_json(r#"{"rev_hash_bytes": 8}"#).unwrap();
        assert_eq!(config.rev_hash_bytes, 8);
        assert_eq!(config.shared_doctype, "io.cozy.shared");
    }

    #[test]
    fn test_invalid_configs() {
        assert!(SharingConfig::from_json(r#"{"rev_hash_bytes": 0}"#).is_err());
        assert!(SharingConfig::from_json(r#"{"files_doctype": "x", "shared_doctype": "x"}"#).is_err());
        assert!(SharingConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("SHARING_FILES_DOCTYPE", "test.files"),
            ("SHARING_MAX_CONFLICT_RENAMES", "3"),
        ]
        .into_iter()
        .collect();
        let config = SharingConfig::from_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.files_doctype, "test.files");
        assert_eq!(config.max_conflict_renames, 3);
        assert_eq!(config.shared_doctype, "io.cozy.shared");
    }

    #[test]
    fn test_from_vars_rejects_garbage_numbers() {
        let err = SharingConfig::from_vars(|k| {
            (k == "SHARING_REV_HASH_BYTES").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
