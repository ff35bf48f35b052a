//! Drop-in descriptor management.
//!
//! A host application activates this backend by the presence of a
//! descriptor file at a well-known path it consults on startup. The
//! descriptor embeds a signature naming this backend, which is how an
//! install by us is told apart from some other backend's file sitting
//! at the same path. Activation and deactivation are therefore file
//! operations here, not configuration mutations in the host.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::entry::unix_now;

/// Descriptor schema version.
pub const DROPIN_SCHEMA_VERSION: u32 = 1;

/// Descriptor schema identifier.
pub const DROPIN_SCHEMA_ID: &str = "larder/dropin@1";

/// Backend signature embedded in descriptors we write.
///
/// Deliberately version-free: a descriptor installed by an older
/// release must still validate as ours, or every upgrade would report
/// a foreign drop-in.
pub const DROPIN_SIGNATURE: &str = "larder object-cache drop-in";

/// Errors from drop-in operations.
#[derive(Debug, Error)]
pub enum DropInError {
    /// A file not written by this backend occupies the descriptor path.
    #[error("an unknown object cache drop-in occupies {path}")]
    ForeignDescriptor { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The descriptor file content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropInDescriptor {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Backend signature; ownership is decided by this field.
    pub signature: String,

    /// Backend release that wrote the descriptor (informational).
    pub version: String,

    /// Installation time, Unix seconds.
    pub installed_at: u64,

    /// Cache directory the backend persists into.
    pub cache_dir: PathBuf,
}

impl DropInDescriptor {
    /// Whether this descriptor was written by this backend.
    pub fn is_ours(&self) -> bool {
        self.schema_id == DROPIN_SCHEMA_ID && self.signature == DROPIN_SIGNATURE
    }
}

/// Installs and removes the descriptor at the host's well-known path.
#[derive(Debug, Clone)]
pub struct DropInManager {
    dropin_path: PathBuf,
    cache_dir: PathBuf,
}

impl DropInManager {
    /// Manager for the given descriptor path and cache directory.
    pub fn new(dropin_path: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            dropin_path: dropin_path.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// The well-known descriptor path.
    pub fn path(&self) -> &Path {
        &self.dropin_path
    }

    /// Whether any file occupies the descriptor path.
    pub fn exists(&self) -> bool {
        self.dropin_path.is_file()
    }

    /// Whether the file at the descriptor path was written by this
    /// backend. Unreadable, unparseable, and foreign files are all `false`.
    pub fn validate(&self) -> bool {
        self.read_descriptor().map_or(false, |d| d.is_ours())
    }

    /// Parse the descriptor at the path, if one parses at all.
    pub fn read_descriptor(&self) -> Option<DropInDescriptor> {
        let contents = fs::read_to_string(&self.dropin_path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Refuse to act over another backend's file.
    ///
    /// Ok when the path is free or holds our own descriptor. Activation
    /// flows call this before [`install`](Self::install) or
    /// [`uninstall`](Self::uninstall); a forced refresh skips it.
    pub fn ensure_ours(&self) -> Result<(), DropInError> {
        if self.exists() && !self.validate() {
            return Err(DropInError::ForeignDescriptor {
                path: self.dropin_path.clone(),
            });
        }
        Ok(())
    }

    /// Write a fresh descriptor, replacing whatever is at the path.
    ///
    /// Used both for first activation and for refreshing the descriptor
    /// after an upgrade. Callers that must not clobber a foreign file
    /// check [`validate`](Self::validate) first. The write goes through
    /// a temp file and rename so the host never observes a partial
    /// descriptor.
    pub fn install(&self) -> Result<(), DropInError> {
        let descriptor = DropInDescriptor {
            schema_version: DROPIN_SCHEMA_VERSION,
            schema_id: DROPIN_SCHEMA_ID.to_string(),
            signature: DROPIN_SIGNATURE.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            installed_at: unix_now(),
            cache_dir: self.cache_dir.clone(),
        };
        let json = serde_json::to_string_pretty(&descriptor)?;

        if let Some(parent) = self.dropin_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.temp_path();
        if let Err(e) = write_file(&temp_path, json.as_bytes()) {
            let _ = fs::remove_file(&temp_path);
            return Err(DropInError::Io(e));
        }
        if let Err(e) = fs::rename(&temp_path, &self.dropin_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(DropInError::Io(e));
        }

        debug!(path = %self.dropin_path.display(), "drop-in descriptor installed");
        Ok(())
    }

    /// Remove the descriptor. Returns whether one was present.
    ///
    /// Removal does not inspect the file; callers check
    /// [`validate`](Self::validate) first when removing a foreign
    /// descriptor would overstep.
    pub fn uninstall(&self) -> Result<bool, DropInError> {
        match fs::remove_file(&self.dropin_path) {
            Ok(()) => {
                debug!(path = %self.dropin_path.display(), "drop-in descriptor removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DropInError::Io(e)),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let file_name = self
            .dropin_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dropin".to_string());
        self.dropin_path
            .with_file_name(format!("{file_name}.{}.{nanos}.tmp", std::process::id()))
    }
}

/// Write bytes to a file, flushing before returning.
fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.flush()?;
    Ok(())
}
