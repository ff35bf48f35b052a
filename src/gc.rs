//! Garbage collection over the cache store.
//!
//! A pass runs under the maintenance lock and walks the store exactly
//! once: first a read-only scan that classifies every entry file, then
//! an eviction phase that deletes in three tiers. Garbage (empty or
//! unparseable files) goes unconditionally, aged entries go by the
//! per-category ttl budgets, and count/disk pressure is relieved oldest
//! first down to the cleanup targets. Scan failure aborts the pass
//! before anything is deleted; individual delete failures are logged
//! and skipped, never fatal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::entry::{unix_now, EntryKind};
use crate::lock::{LockCoordinator, LockError};
use crate::policy::GcPolicy;
use crate::store::{CacheStore, StoreError};

/// Temp files older than this are presumed abandoned by a dead writer.
pub const DEFAULT_ORPHAN_THRESHOLD: Duration = Duration::from_secs(3600);

/// Errors from a garbage collection pass.
#[derive(Debug, Error)]
pub enum GcError {
    /// Another maintenance operation holds the lock. Retry later.
    #[error("cache maintenance already in progress")]
    Busy,

    /// The maintenance lock could not be created or cleared.
    #[error("maintenance lock error: {0}")]
    Lock(#[source] io::Error),

    /// The store could not be enumerated. Nothing was deleted.
    #[error("cache scan failed: {0}")]
    Scan(#[source] StoreError),
}

/// Counters and policy echo from one pass.
///
/// Field names are the reporting contract consumed by operator tooling;
/// the serialized form uses them verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcResult {
    /// Ordinary entry age budget in effect, seconds.
    pub cache_maxttl: u64,
    /// Ordinary entry count trigger in effect.
    pub cache_maxfile: u64,
    /// Store size trigger in effect, bytes.
    pub cache_maxdisk: u64,
    /// Precache entry age budget in effect, seconds.
    pub cleanup_maxttl: u64,
    /// Ordinary entry count target in effect.
    pub cleanup_maxfile: u64,
    /// Precache entry count limit in effect.
    pub cleanup_precache_maxfile: u64,
    /// Store size target in effect, bytes.
    pub cleanup_maxdisk: u64,
    /// Entries evicted by age or threshold pressure.
    pub cache_cleanup: u64,
    /// Garbage files and orphaned temps removed.
    pub cache_ignore: u64,
    /// Entry files observed before eviction.
    pub cache_file: u64,
}

impl GcResult {
    /// Result seeded with the policy echo fields, counters at zero.
    pub fn from_policy(policy: &GcPolicy) -> Self {
        Self {
            cache_maxttl: policy.cache_maxttl,
            cache_maxfile: policy.cache_maxfile,
            cache_maxdisk: policy.cache_maxdisk,
            cleanup_maxttl: policy.cleanup_maxttl,
            cleanup_maxfile: policy.cleanup_maxfile,
            cleanup_precache_maxfile: policy.cleanup_precache_maxfile,
            cleanup_maxdisk: policy.cleanup_maxdisk,
            ..Self::default()
        }
    }

    /// Serialize to JSON (pretty printed).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Classified entry file awaiting the eviction phase.
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    file_size: u64,
    kind: EntryKind,
    created_at: u64,
    expired: bool,
}

/// Policy-driven collector for one cache store.
pub struct GarbageCollector {
    store: CacheStore,
    lock: LockCoordinator,
    policy: GcPolicy,
    orphan_threshold: Duration,
}

impl GarbageCollector {
    /// Create a collector. The policy is normalized so eviction targets
    /// never exceed their triggers.
    pub fn new(store: CacheStore, lock: LockCoordinator, policy: GcPolicy) -> Self {
        Self {
            store,
            lock,
            policy: policy.normalized(),
            orphan_threshold: DEFAULT_ORPHAN_THRESHOLD,
        }
    }

    /// Override the orphaned temp file threshold.
    pub fn with_orphan_threshold(mut self, threshold: Duration) -> Self {
        self.orphan_threshold = threshold;
        self
    }

    /// The policy in effect, after normalization.
    pub fn policy(&self) -> &GcPolicy {
        &self.policy
    }

    /// Run one full collection pass.
    ///
    /// Holds the maintenance lock for the duration; concurrent `get` and
    /// `set` traffic proceeds unlocked and may race individual deletes,
    /// which is why every delete here tolerates absence.
    pub fn run(&self) -> Result<GcResult, GcError> {
        let guard = match self.lock.try_acquire() {
            Ok(guard) => guard,
            Err(LockError::Busy) => return Err(GcError::Busy),
            Err(LockError::Io(e)) => return Err(GcError::Lock(e)),
        };

        let now = unix_now();
        let mut result = GcResult::from_policy(&self.policy);
        debug!(cache_dir = %self.store.cache_dir().display(), "garbage collection pass started");

        // Scan: classify every entry file without deleting anything, so
        // an enumeration failure aborts with the store untouched.
        let mut garbage: Vec<PathBuf> = Vec::new();
        let mut candidates: Vec<Candidate> = Vec::new();
        for item in self.store.entries().map_err(GcError::Scan)? {
            let meta = match item {
                Ok(meta) => meta,
                Err(e) => return Err(GcError::Scan(StoreError::Io(e))),
            };
            result.cache_file += 1;

            if meta.file_size == 0 {
                garbage.push(meta.path);
                continue;
            }
            match CacheStore::read_record(&meta.path) {
                Ok(record) => candidates.push(Candidate {
                    path: meta.path,
                    file_size: meta.file_size,
                    kind: record.kind,
                    created_at: record.created_at,
                    expired: record.is_expired(now),
                }),
                Err(_) => garbage.push(meta.path),
            }
        }

        // Evict tier 1: garbage and abandoned temps.
        for path in garbage {
            if remove_entry_file(&path) {
                result.cache_ignore += 1;
            }
        }
        match self.store.sweep_orphaned_temps(self.orphan_threshold) {
            Ok(swept) => result.cache_ignore += swept as u64,
            Err(e) => warn!(error = %e, "orphaned temp sweep failed"),
        }

        // Evict tier 2: entries past their own ttl or the category age budget.
        let mut survivors: Vec<Candidate> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let age_budget = match candidate.kind {
                EntryKind::Ordinary => self.policy.cache_maxttl,
                EntryKind::Precache => self.policy.cleanup_maxttl,
            };
            let over_age =
                age_budget > 0 && now.saturating_sub(candidate.created_at) > age_budget;
            if candidate.expired || over_age {
                if remove_entry_file(&candidate.path) {
                    result.cache_cleanup += 1;
                } else {
                    survivors.push(candidate);
                }
                continue;
            }
            survivors.push(candidate);
        }

        // Evict tier 3: count and disk pressure, oldest first, down to
        // the cleanup targets. The disk trigger latches on the
        // post-age-eviction total, so deletions in one category cannot
        // unfire it for the next. Precache goes first so disk pressure
        // lands on the high-churn category before ordinary entries.
        let mut total_size: u64 = survivors.iter().map(|c| c.file_size).sum();
        let size_fired = self.policy.cache_maxdisk > 0 && total_size > self.policy.cache_maxdisk;
        let size_target = effective_target(self.policy.cleanup_maxdisk, self.policy.cache_maxdisk);
        for kind in [EntryKind::Precache, EntryKind::Ordinary] {
            let (count_trigger, count_target) = match kind {
                EntryKind::Ordinary => (
                    self.policy.cache_maxfile,
                    effective_target(self.policy.cleanup_maxfile, self.policy.cache_maxfile),
                ),
                EntryKind::Precache => (
                    self.policy.cleanup_precache_maxfile,
                    self.policy.cleanup_precache_maxfile,
                ),
            };
            let mut members: Vec<&Candidate> =
                survivors.iter().filter(|c| c.kind == kind).collect();
            let mut count = members.len() as u64;

            let count_fired = count_trigger > 0 && count > count_trigger;
            if !count_fired && !size_fired {
                continue;
            }
            debug!(
                category = kind.as_str(),
                count,
                total_size,
                "threshold eviction firing"
            );

            members.sort_by_key(|c| c.created_at);
            for candidate in members {
                let count_done = !count_fired || count <= count_target;
                let size_done = !size_fired || total_size <= size_target;
                if count_done && size_done {
                    break;
                }
                if remove_entry_file(&candidate.path) {
                    result.cache_cleanup += 1;
                    count -= 1;
                    total_size = total_size.saturating_sub(candidate.file_size);
                }
            }
        }

        debug!(
            cache_file = result.cache_file,
            cache_cleanup = result.cache_cleanup,
            cache_ignore = result.cache_ignore,
            "garbage collection pass complete"
        );
        drop(guard);
        Ok(result)
    }
}

/// A zero (disabled) target falls back to its trigger, degrading the
/// pair to plain limit enforcement.
fn effective_target(target: u64, trigger: u64) -> u64 {
    if target > 0 {
        target
    } else {
        trigger
    }
}

/// Best-effort delete of one cache file.
///
/// A file already gone counts as removed; the host may delete entries
/// concurrently with a pass.
fn remove_entry_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove cache file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryRecord;
    use crate::key::CacheKey;
    use tempfile::TempDir;

    fn make_test_store(temp_dir: &TempDir) -> CacheStore {
        CacheStore::open(temp_dir.path().join("cache")).unwrap()
    }

    fn make_collector(store: &CacheStore, policy: GcPolicy) -> GarbageCollector {
        let lock = LockCoordinator::new(store.cache_dir());
        GarbageCollector::new(store.clone(), lock, policy)
    }

    /// Policy with every budget disabled; tests switch on one knob at
    /// a time.
    fn open_policy() -> GcPolicy {
        GcPolicy {
            cache_maxttl: 0,
            cache_maxfile: 0,
            cache_maxdisk: 0,
            cleanup_maxttl: 0,
            cleanup_maxfile: 0,
            cleanup_precache_maxfile: 0,
            cleanup_maxdisk: 0,
        }
    }

    fn plant_entry(store: &CacheStore, name: &str, kind: EntryKind, age_secs: u64, ttl: u64) {
        let key = CacheKey::new("site-1", "gc", name);
        let record = EntryRecord::new(key, b"payload-bytes", ttl, kind)
            .with_created_at(unix_now() - age_secs);
        store.write_record(&record).unwrap();
    }

    fn entry_count(store: &CacheStore) -> usize {
        store.entries().unwrap().count()
    }

    #[test]
    fn test_empty_store_pass() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        let gc = make_collector(&store, open_policy());

        let result = gc.run().unwrap();
        assert_eq!(result.cache_file, 0);
        assert_eq!(result.cache_cleanup, 0);
        assert_eq!(result.cache_ignore, 0);
    }

    #[test]
    fn test_result_echoes_policy() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        let gc = make_collector(&store, GcPolicy::default());

        let result = gc.run().unwrap();
        assert_eq!(result.cache_maxttl, 345_600);
        assert_eq!(result.cache_maxfile, 50_000);
        assert_eq!(result.cache_maxdisk, 524_288_000);
        assert_eq!(result.cleanup_maxttl, 86_400);
        assert_eq!(result.cleanup_maxfile, 45_000);
        assert_eq!(result.cleanup_precache_maxfile, 10_000);
        assert_eq!(result.cleanup_maxdisk, 471_859_200);
    }

    #[test]
    fn test_result_serializes_contract_field_names() {
        let result = GcResult::from_policy(&GcPolicy::default());
        let json = result.to_json().unwrap();
        for field in [
            "cache_maxttl",
            "cache_maxfile",
            "cache_maxdisk",
            "cleanup_maxttl",
            "cleanup_maxfile",
            "cleanup_precache_maxfile",
            "cleanup_maxdisk",
            "cache_cleanup",
            "cache_ignore",
            "cache_file",
        ] {
            assert!(json.contains(field), "missing field {field}");
        }
    }

    #[test]
    fn test_garbage_files_are_removed_and_counted() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        plant_entry(&store, "valid", EntryKind::Ordinary, 10, 0);
        std::fs::write(store.cache_dir().join("empty.entry"), b"").unwrap();
        std::fs::write(store.cache_dir().join("mangled.entry"), b"{oops").unwrap();

        let gc = make_collector(&store, open_policy());
        let result = gc.run().unwrap();

        assert_eq!(result.cache_file, 3);
        assert_eq!(result.cache_ignore, 2);
        assert_eq!(result.cache_cleanup, 0);
        assert_eq!(entry_count(&store), 1);
    }

    #[test]
    fn test_orphaned_temps_count_as_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        std::fs::write(store.cache_dir().join("aaa.1.1.tmp"), b"partial").unwrap();

        let gc = make_collector(&store, open_policy()).with_orphan_threshold(Duration::ZERO);
        let result = gc.run().unwrap();

        assert_eq!(result.cache_ignore, 1);
        assert_eq!(result.cache_file, 0);
        assert!(!store.cache_dir().join("aaa.1.1.tmp").exists());
    }

    #[test]
    fn test_expired_entries_are_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        plant_entry(&store, "stale", EntryKind::Ordinary, 120, 60);
        plant_entry(&store, "fresh", EntryKind::Ordinary, 10, 60);

        let gc = make_collector(&store, open_policy());
        let result = gc.run().unwrap();

        assert_eq!(result.cache_cleanup, 1);
        assert_eq!(entry_count(&store), 1);
    }

    #[test]
    fn test_age_budget_evicts_ordinary_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        plant_entry(&store, "ancient", EntryKind::Ordinary, 5000, 0);
        plant_entry(&store, "recent", EntryKind::Ordinary, 100, 0);

        let mut policy = open_policy();
        policy.cache_maxttl = 1000;
        let result = make_collector(&store, policy).run().unwrap();

        assert_eq!(result.cache_cleanup, 1);
        assert_eq!(entry_count(&store), 1);
    }

    #[test]
    fn test_precache_age_budget_is_separate() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        // Same age, different category
        plant_entry(&store, "warm", EntryKind::Precache, 500, 0);
        plant_entry(&store, "real", EntryKind::Ordinary, 500, 0);

        let mut policy = open_policy();
        policy.cache_maxttl = 1000;
        policy.cleanup_maxttl = 100;
        let result = make_collector(&store, policy).run().unwrap();

        // Only the precache entry is past its budget
        assert_eq!(result.cache_cleanup, 1);
        assert_eq!(entry_count(&store), 1);
        assert!(store
            .get(&CacheKey::new("site-1", "gc", "real"))
            .is_some());
    }

    #[test]
    fn test_count_hysteresis_evicts_oldest_down_to_target() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        // Ages 80, 70, ..., 10: "e1" oldest, "e8" newest
        for i in 1..=8u64 {
            plant_entry(
                &store,
                &format!("e{i}"),
                EntryKind::Ordinary,
                (9 - i) * 10,
                0,
            );
        }

        let mut policy = open_policy();
        policy.cache_maxfile = 5;
        policy.cleanup_maxfile = 3;
        let result = make_collector(&store, policy).run().unwrap();

        assert_eq!(result.cache_file, 8);
        assert_eq!(result.cache_cleanup, 5);
        assert_eq!(entry_count(&store), 3);
        // The three newest survive
        for name in ["e6", "e7", "e8"] {
            assert!(
                store.get(&CacheKey::new("site-1", "gc", name)).is_some(),
                "{name} should survive"
            );
        }
    }

    #[test]
    fn test_count_below_trigger_evicts_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        for i in 0..4u64 {
            plant_entry(&store, &format!("e{i}"), EntryKind::Ordinary, i * 10, 0);
        }

        let mut policy = open_policy();
        policy.cache_maxfile = 5;
        policy.cleanup_maxfile = 3;
        let result = make_collector(&store, policy).run().unwrap();

        // Population sits between target and trigger: hysteresis holds
        assert_eq!(result.cache_cleanup, 0);
        assert_eq!(entry_count(&store), 4);
    }

    #[test]
    fn test_precache_count_limit() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        plant_entry(&store, "p-old", EntryKind::Precache, 300, 0);
        plant_entry(&store, "p-mid", EntryKind::Precache, 200, 0);
        plant_entry(&store, "p-new", EntryKind::Precache, 100, 0);
        plant_entry(&store, "o-old", EntryKind::Ordinary, 400, 0);

        let mut policy = open_policy();
        policy.cleanup_precache_maxfile = 2;
        let result = make_collector(&store, policy).run().unwrap();

        assert_eq!(result.cache_cleanup, 1);
        assert_eq!(entry_count(&store), 3);
        assert!(store
            .get(&CacheKey::new("site-1", "gc", "p-old"))
            .is_none());
        assert!(store
            .get(&CacheKey::new("site-1", "gc", "o-old"))
            .is_some());
    }

    #[test]
    fn test_disk_hysteresis_evicts_oldest_down_to_target() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        for i in 1..=4u64 {
            plant_entry(&store, &format!("e{i}"), EntryKind::Ordinary, (5 - i) * 10, 0);
        }

        // Uniform payloads make per-file size constant
        let sizes: Vec<u64> = store
            .entries()
            .unwrap()
            .map(|m| m.unwrap().file_size)
            .collect();
        let per_file = sizes[0];
        assert!(sizes.iter().all(|s| *s == per_file));
        let total: u64 = sizes.iter().sum();

        let mut policy = open_policy();
        policy.cache_maxdisk = total - 1;
        policy.cleanup_maxdisk = per_file * 2;
        let result = make_collector(&store, policy).run().unwrap();

        // Two oldest go to reach the target
        assert_eq!(result.cache_cleanup, 2);
        assert_eq!(entry_count(&store), 2);
        for name in ["e3", "e4"] {
            assert!(store.get(&CacheKey::new("site-1", "gc", name)).is_some());
        }
    }

    #[test]
    fn test_disk_pressure_spans_categories() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        // "p1" oldest precache, "o1" oldest ordinary
        for i in 1..=4u64 {
            plant_entry(&store, &format!("p{i}"), EntryKind::Precache, 1000 - i * 10, 0);
        }
        for i in 1..=6u64 {
            plant_entry(&store, &format!("o{i}"), EntryKind::Ordinary, 500 - i * 10, 0);
        }

        let sizes: Vec<u64> = store
            .entries()
            .unwrap()
            .map(|m| m.unwrap().file_size)
            .collect();
        let per_file = sizes[0];
        assert!(sizes.iter().all(|s| *s == per_file));

        // Deleting all four precache entries lands at six files: below
        // the trigger, still above the target. The pass keeps going
        // into the ordinary category until the target is reached.
        let mut policy = open_policy();
        policy.cache_maxdisk = per_file * 7;
        policy.cleanup_maxdisk = per_file * 5;
        let result = make_collector(&store, policy).run().unwrap();

        assert_eq!(result.cache_file, 10);
        assert_eq!(result.cache_cleanup, 5);
        assert_eq!(entry_count(&store), 5);
        for name in ["p1", "p2", "p3", "p4", "o1"] {
            assert!(
                store.get(&CacheKey::new("site-1", "gc", name)).is_none(),
                "{name} should be evicted"
            );
        }
        for name in ["o2", "o3", "o4", "o5", "o6"] {
            assert!(
                store.get(&CacheKey::new("site-1", "gc", name)).is_some(),
                "{name} should survive"
            );
        }
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        for i in 1..=8u64 {
            plant_entry(&store, &format!("e{i}"), EntryKind::Ordinary, i * 10, 0);
        }

        let mut policy = open_policy();
        policy.cache_maxfile = 5;
        policy.cleanup_maxfile = 3;

        let first = make_collector(&store, policy.clone()).run().unwrap();
        assert_eq!(first.cache_cleanup, 5);

        let second = make_collector(&store, policy).run().unwrap();
        assert_eq!(second.cache_file, 3);
        assert_eq!(second.cache_cleanup, 0);
        assert_eq!(second.cache_ignore, 0);
    }

    #[test]
    fn test_held_lock_aborts_pass() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        plant_entry(&store, "survivor", EntryKind::Ordinary, 10_000, 0);

        let lock = LockCoordinator::new(store.cache_dir());
        let _guard = lock.try_acquire().unwrap();

        let mut policy = open_policy();
        policy.cache_maxttl = 100;
        let err = make_collector(&store, policy).run().unwrap_err();

        assert!(matches!(err, GcError::Busy));
        // Nothing was deleted
        assert_eq!(entry_count(&store), 1);
    }

    #[test]
    #[cfg(unix)]
    fn test_unlistable_cache_dir_aborts_pass() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        plant_entry(&store, "survivor", EntryKind::Ordinary, 10_000, 0);

        // Writable but unlistable: the lock file can still be created
        // and removed, the entry scan cannot start
        let dir = store.cache_dir().to_path_buf();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o333)).unwrap();
        if std::fs::read_dir(&dir).is_ok() {
            // Privileged users ignore directory permission bits
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let mut policy = open_policy();
        policy.cache_maxttl = 100;
        let err = make_collector(&store, policy).run().unwrap_err();
        assert!(matches!(err, GcError::Scan(_)));

        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        // The abort released the lock and deleted nothing
        assert!(!dir.join(LockCoordinator::LOCK_FILENAME).exists());
        assert_eq!(entry_count(&store), 1);
    }

    #[test]
    fn test_lock_released_after_pass() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);
        let gc = make_collector(&store, open_policy());

        gc.run().unwrap();
        gc.run().unwrap();

        let lock = LockCoordinator::new(store.cache_dir());
        assert!(lock.try_acquire().is_ok());
    }

    #[test]
    fn test_constructor_normalizes_policy() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_test_store(&temp_dir);

        let mut policy = open_policy();
        policy.cache_maxfile = 10;
        policy.cleanup_maxfile = 50;
        let gc = make_collector(&store, policy);

        assert_eq!(gc.policy().cleanup_maxfile, 10);
    }
}
