//! File-backed cache store.
//!
//! One entry per file under a flat cache directory, named by the key
//! digest with an `.entry` extension. Writers publish through a unique
//! temp file followed by an atomic rename, so readers only ever observe
//! complete entries. Reads are fail-open: any I/O or parse problem is a
//! cache miss, never an error surfaced to the host's hot path.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};

use crate::entry::{unix_now, EntryKind, EntryRecord, ENTRY_EXTENSION};
use crate::key::CacheKey;

/// Extension used by in-flight temp files.
pub const TEMP_EXTENSION: &str = "tmp";

/// Errors from store write and maintenance operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Shallow metadata for one entry file, as yielded by [`CacheStore::entries`].
///
/// Deliberately cheap: path and size come from the directory scan alone,
/// without opening the file. Callers that need the envelope parse it
/// separately via [`CacheStore::read_record`].
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// Absolute path of the entry file.
    pub path: PathBuf,
    /// Size of the entry file in bytes.
    pub file_size: u64,
}

/// File-backed key/value store for one cache directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
}

impl CacheStore {
    /// Create a handle without touching the filesystem.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Open a store, creating the cache directory if needed.
    ///
    /// Probes writability up front so a misconfigured path surfaces here
    /// rather than as silent misses later.
    pub fn open(cache_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Self::new(cache_dir);
        fs::create_dir_all(&store.cache_dir)?;

        let probe = store.cache_dir.join(".store_test");
        File::create(&probe)?;
        fs::remove_file(&probe)?;

        Ok(store)
    }

    /// The directory this store persists into.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Final path for a key digest.
    fn entry_path(&self, digest: &str) -> PathBuf {
        self.cache_dir.join(format!("{digest}.{ENTRY_EXTENSION}"))
    }

    /// Unique temp path for an in-flight write of a key digest.
    ///
    /// Pid plus nanosecond timestamp keeps concurrent writers of the
    /// same key from sharing a temp file.
    fn temp_path(&self, digest: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        self.cache_dir.join(format!(
            "{digest}.{}.{}.{TEMP_EXTENSION}",
            std::process::id(),
            nanos
        ))
    }

    /// Look up a value. Expired, missing, and unreadable entries are
    /// all misses.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let digest = key.digest().ok()?;
        let record = Self::read_record(&self.entry_path(&digest)).ok()?;
        if record.is_expired(unix_now()) {
            return None;
        }
        record.payload_bytes().ok()
    }

    /// Store a value, replacing any existing entry for the key.
    pub fn set(&self, key: &CacheKey, value: &[u8], ttl: u64, kind: EntryKind) -> StoreResult<()> {
        let record = EntryRecord::new(key.clone(), value, ttl, kind);
        self.write_record(&record)
    }

    /// Remove the entry for a key. Returns whether an entry existed.
    pub fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
        let digest = key.digest()?;
        match fs::remove_file(self.entry_path(&digest)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Remove every entry file, returning how many were removed.
    ///
    /// Best-effort: keeps sweeping past individual failures and reports
    /// the first one at the end. Callers serialize flushes against other
    /// maintenance through the maintenance lock.
    pub fn flush(&self) -> StoreResult<usize> {
        let mut removed = 0usize;
        let mut first_err: Option<io::Error> = None;

        for item in self.entries()? {
            let meta = match item {
                Ok(meta) => meta,
                Err(e) => {
                    first_err.get_or_insert(e);
                    continue;
                }
            };
            match fs::remove_file(&meta.path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %meta.path.display(), error = %e, "failed to remove entry during flush");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(StoreError::Io(e)),
            None => {
                debug!(removed, "cache flush complete");
                Ok(removed)
            }
        }
    }

    /// Enumerate entry files lazily.
    ///
    /// Yields only regular files with the `.entry` extension; temp
    /// files, the maintenance lock, and anything foreign are skipped.
    /// No envelopes are opened, so enumerating a large store stays at
    /// one readdir stream plus one stat per entry.
    pub fn entries(&self) -> StoreResult<Entries> {
        Ok(Entries {
            inner: fs::read_dir(&self.cache_dir)?,
        })
    }

    /// Parse one entry envelope from disk.
    pub fn read_record(path: &Path) -> StoreResult<EntryRecord> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Persist an entry envelope via temp file plus atomic rename.
    ///
    /// The rename makes replacement last-writer-wins at whole-entry
    /// granularity; a concurrent reader sees either the old or the new
    /// envelope, never a mix.
    pub fn write_record(&self, record: &EntryRecord) -> StoreResult<()> {
        let digest = record.key.digest()?;
        let final_path = self.entry_path(&digest);
        let temp_path = self.temp_path(&digest);
        let json = serde_json::to_vec(record)?;

        if let Err(e) = write_file(&temp_path, &json) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io(e));
        }
        if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io(e));
        }
        Ok(())
    }

    /// Remove temp files older than the threshold, returning how many
    /// were removed.
    ///
    /// Temps newer than the threshold may belong to in-flight writers
    /// and are left alone.
    pub fn sweep_orphaned_temps(&self, older_than: Duration) -> StoreResult<usize> {
        let mut cleaned = 0usize;

        for item in fs::read_dir(&self.cache_dir)? {
            let entry = match item {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TEMP_EXTENSION) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let Ok(age) = modified.elapsed() else {
                continue;
            };
            if age > older_than && fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "removed orphaned temp file");
                cleaned += 1;
            }
        }

        Ok(cleaned)
    }
}

/// Lazy iterator over entry files, produced by [`CacheStore::entries`].
///
/// Items are `Err` when the underlying directory stream fails mid-scan;
/// unreadable individual files are skipped rather than surfaced.
#[derive(Debug)]
pub struct Entries {
    inner: fs::ReadDir,
}

impl Iterator for Entries {
    type Item = io::Result<EntryMeta>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            return Some(Ok(EntryMeta {
                path,
                file_size: metadata.len(),
            }));
        }
    }
}

/// Write bytes to a file, flushing before returning.
fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.flush()?;
    Ok(())
}
