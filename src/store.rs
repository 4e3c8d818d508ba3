use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::flag::FlagRecord;

#[derive(Default)]
struct StoreState {
    flags: HashMap<String, FlagRecord>,
    initialized: bool,
}

/// In-memory flag storage backed by a `RwLock<HashMap>`.
///
/// For any key the stored version never goes down: an `upsert` or `delete`
/// whose version is not strictly greater than the current one is dropped.
/// Deleted keys are kept as tombstones so a late update cannot resurrect
/// them, and are hidden from every read.
///
/// Mutations return `true` when they committed a change.
#[derive(Default)]
pub struct FlagRecordStore {
    state: RwLock<StoreState>,
}

impl FlagRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace every record with `records` and mark the store initialized.
    /// The new map is built before the lock is taken, so readers see either
    /// the old contents or the new ones.
    pub fn init(&self, records: HashMap<String, FlagRecord>) -> bool {
        let flags: HashMap<String, FlagRecord> = records
            .into_iter()
            .map(|(key, mut record)| {
                if record.key.is_empty() {
                    record.key = key.clone();
                }
                (key, record)
            })
            .collect();

        let mut state = self.write();
        state.flags = flags;
        state.initialized = true;
        true
    }

    pub fn upsert(&self, key: &str, mut record: FlagRecord) -> bool {
        if record.key.is_empty() {
            record.key = key.to_string();
        }
        let mut state = self.write();
        if let Some(existing) = state.flags.get(key) {
            if record.version <= existing.version {
                return false;
            }
        }
        state.flags.insert(key.to_string(), record);
        true
    }

    /// Tombstone `key` at `version`. An absent key still gets a tombstone so
    /// that a create delivered after its own delete stays deleted.
    pub fn delete(&self, key: &str, version: u64) -> bool {
        self.upsert(key, FlagRecord::tombstone(key, version))
    }

    pub fn get(&self, key: &str) -> Option<FlagRecord> {
        self.read()
            .flags
            .get(key)
            .filter(|record| !record.deleted)
            .cloned()
    }

    pub fn all(&self) -> HashMap<String, FlagRecord> {
        self.read()
            .flags
            .iter()
            .filter(|(_, record)| !record.deleted)
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect()
    }

    /// Live keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .read()
            .flags
            .iter()
            .filter(|(_, record)| !record.deleted)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of live (non-deleted) records.
    pub fn len(&self) -> usize {
        self.read().flags.values().filter(|r| !r.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current version for `key`, tombstones included.
    pub fn version_of(&self, key: &str) -> Option<u64> {
        self.read().flags.get(key).map(|r| r.version)
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Drop all records, tombstones included, and reset `initialized`.
    pub fn clear(&self) {
        let mut state = self.write();
        state.flags.clear();
        state.initialized = false;
    }
}
