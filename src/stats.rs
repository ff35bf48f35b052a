//! Operator-facing status and size reporting.
//!
//! Read-only views over the drop-in descriptor and the cache directory.
//! Formatting beyond byte humanization lives in the CLI; embedders get
//! the raw values.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use walkdir::WalkDir;

use crate::dropin::DropInManager;
use crate::store::{CacheStore, StoreResult};

/// Activation snapshot for operator display.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// Whether our descriptor is installed and valid.
    pub enabled: bool,
    /// Whether any file occupies the descriptor path.
    pub dropin_present: bool,
    /// The well-known descriptor path.
    pub descriptor_path: PathBuf,
    /// The cache directory in use.
    pub cache_dir: PathBuf,
}

/// Status and size queries over one store and its drop-in.
pub struct StatsReporter {
    store: CacheStore,
    dropin: DropInManager,
    size_reporting: bool,
}

impl StatsReporter {
    /// Reporter with size reporting on.
    pub fn new(store: CacheStore, dropin: DropInManager) -> Self {
        Self {
            store,
            dropin,
            size_reporting: true,
        }
    }

    /// Toggle size reporting. Disabled reporters answer size queries
    /// with `None` instead of walking the directory.
    pub fn with_size_reporting(mut self, enabled: bool) -> Self {
        self.size_reporting = enabled;
        self
    }

    /// Current activation state.
    pub fn status(&self) -> CacheStatus {
        CacheStatus {
            enabled: self.dropin.validate(),
            dropin_present: self.dropin.exists(),
            descriptor_path: self.dropin.path().to_path_buf(),
            cache_dir: self.store.cache_dir().to_path_buf(),
        }
    }

    /// Total bytes under the cache directory, or `None` when size
    /// reporting is disabled.
    ///
    /// The walk stats every file, so large stores pay for this query;
    /// that is exactly why it can be configured off. The non-recursive
    /// form covers the flat entry layout only.
    pub fn cache_size(&self, recursive: bool) -> StoreResult<Option<u64>> {
        if !self.size_reporting {
            return Ok(None);
        }

        let root = self.store.cache_dir();
        let mut total = 0u64;
        if recursive {
            for entry in WalkDir::new(root).follow_links(false) {
                let entry = entry.map_err(io::Error::from)?;
                if entry.file_type().is_file() {
                    total += entry.metadata().map_err(io::Error::from)?.len();
                }
            }
        } else {
            for item in fs::read_dir(root)? {
                let metadata = item?.metadata()?;
                if metadata.is_file() {
                    total += metadata.len();
                }
            }
        }
        Ok(Some(total))
    }
}

/// Format a byte count for humans: `500 MB`, `1.5 KB`, `17 B`.
pub fn normalize_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        return format!("{bytes} B");
    }
    let formatted = format!("{value:.2}");
    let formatted = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{formatted} {}", UNITS[unit])
}
