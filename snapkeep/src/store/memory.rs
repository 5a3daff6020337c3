//! In-memory backend.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::SnapshotStore;
use crate::error::StoreError;
use crate::snapshot::{Snapshot, SnapshotUsage};

#[derive(Debug, Default)]
struct Inner {
    snapshots: BTreeMap<String, (Snapshot, SnapshotUsage)>,
    failing_deletes: HashSet<String>,
    created: usize,
    deleted: usize,
}

/// A store that keeps snapshot records in memory.
///
/// Useful for tests and for exercising retention against a synthetic
/// history. Deletes of selected names can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `snapshots`.
    pub fn with_snapshots(snapshots: impl IntoIterator<Item = Snapshot>) -> Self {
        let store = Self::new();
        for snapshot in snapshots {
            store.insert(snapshot, SnapshotUsage::default());
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // No operation leaves `Inner` half-updated, so a poisoned lock is
        // still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or replaces a snapshot record.
    pub fn insert(&self, snapshot: Snapshot, usage: SnapshotUsage) {
        self.lock()
            .snapshots
            .insert(snapshot.name().to_string(), (snapshot, usage));
    }

    /// Makes every future delete of `name` fail.
    pub fn fail_delete(&self, name: impl Into<String>) {
        self.lock().failing_deletes.insert(name.into());
    }

    /// Returns `true` if a snapshot called `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().snapshots.contains_key(name)
    }

    /// Number of snapshots stored.
    pub fn len(&self) -> usize {
        self.lock().snapshots.len()
    }

    /// Returns `true` if the store holds no snapshots.
    pub fn is_empty(&self) -> bool {
        self.lock().snapshots.is_empty()
    }

    /// Number of successful creates.
    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    /// Number of successful deletes.
    pub fn deleted_count(&self) -> usize {
        self.lock().deleted
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, name: &str, when: DateTime<Utc>) -> Result<Snapshot, StoreError> {
        let mut inner = self.lock();
        if inner.snapshots.contains_key(name) {
            return Err(StoreError::AlreadyExists {
                name: name.to_string(),
            });
        }
        let snapshot = Snapshot::new(name, when);
        inner
            .snapshots
            .insert(name.to_string(), (snapshot.clone(), SnapshotUsage::default()));
        inner.created += 1;
        Ok(snapshot)
    }

    async fn list(&self) -> Result<Vec<Snapshot>, StoreError> {
        let mut snapshots: Vec<_> = self
            .lock()
            .snapshots
            .values()
            .map(|(snapshot, _)| snapshot.clone())
            .collect();
        snapshots.sort();
        Ok(snapshots)
    }

    async fn delete(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.failing_deletes.contains(snapshot.name()) {
            return Err(StoreError::CommandFailed {
                command: format!("delete {}", snapshot.name()),
                stderr: "injected failure".to_string(),
            });
        }
        if inner.snapshots.remove(snapshot.name()).is_none() {
            return Err(StoreError::NotFound {
                name: snapshot.name().to_string(),
            });
        }
        inner.deleted += 1;
        Ok(())
    }

    async fn usage(&self, snapshot: &Snapshot) -> Result<SnapshotUsage, StoreError> {
        self.lock()
            .snapshots
            .get(snapshot.name())
            .map(|(_, usage)| *usage)
            .ok_or_else(|| StoreError::NotFound {
                name: snapshot.name().to_string(),
            })
    }
}
