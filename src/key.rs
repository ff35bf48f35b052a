//! Cache key identity and on-disk naming.
//!
//! A [`CacheKey`] identifies one cached value inside a host application:
//! the host namespace (site or tenant), the entry group, and the entry
//! name. Keys never appear verbatim on disk; the file stem is a SHA-256
//! digest of the canonical JSON form of the key, so arbitrary group and
//! name strings cannot escape the cache directory.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Logical identity of one cached value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Host namespace (site, tenant, or installation id).
    pub namespace: String,
    /// Entry group within the namespace.
    pub group: String,
    /// Entry name within the group.
    pub name: String,
}

impl CacheKey {
    /// Create a key from its three components.
    pub fn new(
        namespace: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            name: name.into(),
        }
    }

    /// Compute the on-disk file stem for this key.
    ///
    /// The digest is SHA-256 over the JCS (RFC 8785) canonical JSON form
    /// of the key, hex-encoded. Canonicalization fixes field order and
    /// string escaping, so every process derives the same stem for the
    /// same key.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json_canonicalizer::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.group, self.name)
    }
}
