//! Garbage collection budgets.

use serde::{Deserialize, Serialize};

/// Eviction budgets for one garbage collection pass.
///
/// The count and disk knobs come in trigger/target pairs: a pass starts
/// evicting only once the population exceeds the trigger, then evicts
/// down to the lower target. The gap keeps a store hovering near a limit
/// from being trimmed on every pass. Every knob treats zero as disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcPolicy {
    /// Maximum age in seconds for ordinary entries (0 = unlimited).
    #[serde(default = "default_cache_maxttl")]
    pub cache_maxttl: u64,

    /// Ordinary entry count that triggers threshold eviction (0 = unlimited).
    #[serde(default = "default_cache_maxfile")]
    pub cache_maxfile: u64,

    /// Total store size in bytes that triggers threshold eviction (0 = unlimited).
    #[serde(default = "default_cache_maxdisk")]
    pub cache_maxdisk: u64,

    /// Maximum age in seconds for precache entries (0 = unlimited).
    #[serde(default = "default_cleanup_maxttl")]
    pub cleanup_maxttl: u64,

    /// Ordinary entry count a triggered pass evicts down to.
    #[serde(default = "default_cleanup_maxfile")]
    pub cleanup_maxfile: u64,

    /// Precache entry count limit; trigger and target in one (0 = unlimited).
    #[serde(default = "default_cleanup_precache_maxfile")]
    pub cleanup_precache_maxfile: u64,

    /// Store size in bytes a triggered pass evicts down to.
    #[serde(default = "default_cleanup_maxdisk")]
    pub cleanup_maxdisk: u64,
}

fn default_cache_maxttl() -> u64 {
    4 * 86400
}

fn default_cache_maxfile() -> u64 {
    50_000
}

fn default_cache_maxdisk() -> u64 {
    500 * 1024 * 1024
}

fn default_cleanup_maxttl() -> u64 {
    86400
}

fn default_cleanup_maxfile() -> u64 {
    45_000
}

fn default_cleanup_precache_maxfile() -> u64 {
    10_000
}

fn default_cleanup_maxdisk() -> u64 {
    450 * 1024 * 1024
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            cache_maxttl: default_cache_maxttl(),
            cache_maxfile: default_cache_maxfile(),
            cache_maxdisk: default_cache_maxdisk(),
            cleanup_maxttl: default_cleanup_maxttl(),
            cleanup_maxfile: default_cleanup_maxfile(),
            cleanup_precache_maxfile: default_cleanup_precache_maxfile(),
            cleanup_maxdisk: default_cleanup_maxdisk(),
        }
    }
}

impl GcPolicy {
    /// Clamp each eviction target to its trigger.
    ///
    /// A target above its trigger would make a pass evict back up past
    /// the point that started it; clamping degrades that configuration
    /// to plain limit enforcement instead.
    pub fn normalized(mut self) -> Self {
        if self.cache_maxfile > 0 && self.cleanup_maxfile > self.cache_maxfile {
            self.cleanup_maxfile = self.cache_maxfile;
        }
        if self.cache_maxdisk > 0 && self.cleanup_maxdisk > self.cache_maxdisk {
            self.cleanup_maxdisk = self.cache_maxdisk;
        }
        self
    }
}
