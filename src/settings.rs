//! Runtime settings (larder.toml).
//!
//! Everything is optional; an absent file or empty table yields the
//! built-in defaults. The `[gc]` table maps straight onto
//! [`GcPolicy`](crate::policy::GcPolicy).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::GcPolicy;

/// Errors from settings loading.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables shared by the library embedder and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding entry files and the maintenance lock.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Well-known path the host consults for the drop-in descriptor.
    #[serde(default = "default_dropin_path")]
    pub dropin_path: PathBuf,

    /// Seconds before a held maintenance lock is presumed abandoned.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,

    /// Whether size queries walk the cache directory.
    #[serde(default = "default_size_reporting")]
    pub size_reporting: bool,

    /// Garbage collection budgets.
    #[serde(default)]
    pub gc: GcPolicy,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/larder/cache")
}

fn default_dropin_path() -> PathBuf {
    PathBuf::from("/var/lib/larder/object-cache.json")
}

fn default_lock_stale_secs() -> u64 {
    180
}

fn default_size_reporting() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            dropin_path: default_dropin_path(),
            lock_stale_secs: default_lock_stale_secs(),
            size_reporting: default_size_reporting(),
            gc: GcPolicy::default(),
        }
    }
}

impl Settings {
    /// Settings file name looked up in the working directory when no
    /// explicit path is given.
    pub const DEFAULT_FILENAME: &'static str = "larder.toml";

    /// Load and parse settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    /// Parse settings from a TOML string.
    pub fn from_str(s: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.cache_dir, PathBuf::from("/var/lib/larder/cache"));
        assert_eq!(
            settings.dropin_path,
            PathBuf::from("/var/lib/larder/object-cache.json")
        );
        assert_eq!(settings.lock_stale_secs, 180);
        assert!(settings.size_reporting);
        assert_eq!(settings.gc, GcPolicy::default());
    }

    #[test]
    fn test_empty_string_matches_defaults() {
        let settings = Settings::from_str("").unwrap();
        assert_eq!(settings.cache_dir, Settings::default().cache_dir);
        assert_eq!(settings.gc, GcPolicy::default());
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings = Settings::from_str(
            r#"
            cache_dir = "/tmp/larder-test/cache"
            size_reporting = false
            "#,
        )
        .unwrap();
        assert_eq!(settings.cache_dir, PathBuf::from("/tmp/larder-test/cache"));
        assert!(!settings.size_reporting);
        assert_eq!(settings.lock_stale_secs, 180);
    }

    #[test]
    fn test_gc_table_overrides() {
        let settings = Settings::from_str(
            r#"
            [gc]
            cache_maxfile = 100
            cleanup_maxfile = 80
            "#,
        )
        .unwrap();
        assert_eq!(settings.gc.cache_maxfile, 100);
        assert_eq!(settings.gc.cleanup_maxfile, 80);
        assert_eq!(settings.gc.cache_maxttl, GcPolicy::default().cache_maxttl);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = Settings::from_str("cache_dir = [broken").unwrap_err();
        assert!(matches!(err, SettingsError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = Settings::from_file(&temp_dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, SettingsError::Io(_)));
    }

    #[test]
    fn test_from_file_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(Settings::DEFAULT_FILENAME);
        fs::write(&path, "lock_stale_secs = 30\n").unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.lock_stale_secs, 30);
    }
}
