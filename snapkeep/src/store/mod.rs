//! Snapshot storage backends.
//!
//! A [`SnapshotStore`] creates, lists and deletes snapshots of the managed
//! data. The retention logic only sees [`Snapshot`] records, so any backend
//! that can map names to timestamps works with it.
//!
//! Three backends ship with the crate:
//!
//! - [`TarStore`]: compressed tar archives of a source directory.
//! - [`ZfsStore`]: native ZFS snapshots of a dataset, via the `zfs` command.
//! - [`MemoryStore`]: an in-memory store for tests and dry runs.

mod archive;
mod memory;
mod zfs;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::snapshot::{Snapshot, SnapshotUsage};

pub use self::archive::{Compression, TarConfig, TarStore};
pub use self::memory::MemoryStore;
pub use self::zfs::{ZfsConfig, ZfsStore};

/// A place snapshots live.
///
/// Implementations take `&self` and must be safe to share; the cycle holds
/// the store for the life of the process.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Short backend name for logs ("tar", "zfs", "memory").
    fn kind(&self) -> &'static str;

    /// Takes a new snapshot called `name`, recorded as taken at `when`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails; no partial snapshot is
    /// left under `name`.
    async fn create(&self, name: &str, when: DateTime<Utc>) -> Result<Snapshot, StoreError>;

    /// Lists managed snapshots, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend cannot be read.
    async fn list(&self) -> Result<Vec<Snapshot>, StoreError>;

    /// Deletes a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the snapshot cannot be removed.
    async fn delete(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Reports how much space a snapshot uses.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend cannot be queried.
    async fn usage(&self, snapshot: &Snapshot) -> Result<SnapshotUsage, StoreError>;
}

#[async_trait]
impl<S: SnapshotStore + ?Sized> SnapshotStore for Box<S> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    async fn create(&self, name: &str, when: DateTime<Utc>) -> Result<Snapshot, StoreError> {
        (**self).create(name, when).await
    }

    async fn list(&self) -> Result<Vec<Snapshot>, StoreError> {
        (**self).list().await
    }

    async fn delete(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        (**self).delete(snapshot).await
    }

    async fn usage(&self, snapshot: &Snapshot) -> Result<SnapshotUsage, StoreError> {
        (**self).usage(snapshot).await
    }
}

#[async_trait]
impl<S: SnapshotStore + ?Sized> SnapshotStore for Arc<S> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    async fn create(&self, name: &str, when: DateTime<Utc>) -> Result<Snapshot, StoreError> {
        (**self).create(name, when).await
    }

    async fn list(&self) -> Result<Vec<Snapshot>, StoreError> {
        (**self).list().await
    }

    async fn delete(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        (**self).delete(snapshot).await
    }

    async fn usage(&self, snapshot: &Snapshot) -> Result<SnapshotUsage, StoreError> {
        (**self).usage(snapshot).await
    }
}
