//! On-disk cache entry format.
//!
//! Each cached value lives in its own file as a small JSON envelope:
//! schema marker, the logical key, the entry category, creation time,
//! per-entry ttl, and the opaque payload (base64). Creation time is
//! embedded in the envelope rather than taken from file mtime, so copy
//! or touch operations on the cache directory cannot extend an entry's
//! lifetime.

use serde::{Deserialize, Serialize};

use crate::key::CacheKey;

/// Entry envelope schema version.
pub const ENTRY_SCHEMA_VERSION: u32 = 1;

/// Entry envelope schema identifier.
pub const ENTRY_SCHEMA_ID: &str = "larder/entry@1";

/// File extension for finalized entry files.
pub const ENTRY_EXTENSION: &str = "entry";

/// Entry category.
///
/// Precache entries are speculative warm-up data with high churn; the
/// garbage collector holds them to tighter budgets than ordinary entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Regular host-written entry.
    #[default]
    Ordinary,
    /// Speculative warm-up entry, evicted more aggressively.
    Precache,
}

impl EntryKind {
    /// Serialized form, as written into entry envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ordinary => "ordinary",
            Self::Precache => "precache",
        }
    }
}

/// One cached value as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Logical key this entry was stored under.
    pub key: CacheKey,

    /// Entry category.
    #[serde(default)]
    pub kind: EntryKind,

    /// Creation time, Unix seconds.
    pub created_at: u64,

    /// Time-to-live in seconds. Zero means the entry never expires on
    /// its own; the garbage collector's age budgets still apply.
    #[serde(default)]
    pub ttl: u64,

    /// Opaque payload, base64-encoded.
    payload: String,
}

impl EntryRecord {
    /// Create a record for a value being stored now.
    pub fn new(key: CacheKey, payload: &[u8], ttl: u64, kind: EntryKind) -> Self {
        Self {
            schema_version: ENTRY_SCHEMA_VERSION,
            schema_id: ENTRY_SCHEMA_ID.to_string(),
            key,
            kind,
            created_at: unix_now(),
            ttl,
            payload: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, payload),
        }
    }

    /// Override the creation time. Maintenance tooling and tests use
    /// this to plant records at a chosen point in the past.
    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Decode the payload bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &self.payload)
    }

    /// Age of this entry in seconds at time `now`.
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// Check whether this entry's own ttl has elapsed at time `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl > 0 && self.age(now) >= self.ttl
    }
}

/// Current time as Unix seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
