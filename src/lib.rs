//! Larder - file-backed object cache core
//!
//! This crate implements the persistence and maintenance core of a
//! file-backed object cache: one file per entry with atomic replace,
//! drop-in descriptor activation, a cross-process maintenance lock,
//! policy-driven garbage collection, and status reporting. The host
//! application's hot path reads and writes entries without ever taking
//! a lock; maintenance serializes itself around everything else.

pub mod dropin;
pub mod entry;
pub mod gc;
pub mod key;
pub mod lock;
pub mod policy;
pub mod settings;
pub mod stats;
pub mod store;

pub use dropin::{DropInDescriptor, DropInError, DropInManager};
pub use entry::{EntryKind, EntryRecord};
pub use gc::{GarbageCollector, GcError, GcResult};
pub use key::CacheKey;
pub use lock::{LockCoordinator, LockError, LockRecord, MaintenanceGuard};
pub use policy::GcPolicy;
pub use settings::{Settings, SettingsError};
pub use stats::{normalize_size, CacheStatus, StatsReporter};
pub use store::{CacheStore, EntryMeta, StoreError};
