//! Retention runs against a store.
//!
//! [`prune`] lists a store, classifies against its newest snapshot, logs the
//! outcome and deletes whatever the policy does not keep. A failed delete is
//! counted and the batch continues; a failed list aborts the run.

use serde::Serialize;

use crate::error::StoreError;
use crate::policy::RetentionPolicy;
use crate::retention::{Classification, PolicyWarning, classify_from_newest};
use crate::snapshot::{Snapshot, SnapshotUsage};
use crate::store::SnapshotStore;

/// Outcome of a retention run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Snapshots kept.
    pub kept: usize,
    /// Snapshots deleted.
    pub removed: usize,
    /// Deletes that failed.
    pub failed: usize,
    /// Snapshots a dry run would have deleted.
    pub would_remove: usize,
    /// Disk space used by kept snapshots.
    pub space_kept: u64,
    /// Logical size of kept snapshots.
    pub size_kept: u64,
    /// Disk space freed by deleted snapshots.
    pub space_saved: u64,
    /// Logical size of deleted snapshots.
    pub size_saved: u64,
    /// Policy diagnostics from classification.
    #[serde(skip)]
    pub warnings: Vec<PolicyWarning>,
}

/// Formats a byte count for logs.
///
/// # Examples
///
/// ```rust
/// use snapkeep::prune::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.5 KB");
/// assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
/// ```
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Lists `store` and classifies its snapshots against the newest one.
///
/// # Errors
///
/// Returns [`StoreError`] if the store cannot be listed.
pub async fn plan<S>(store: &S, policy: &RetentionPolicy) -> Result<Classification, StoreError>
where
    S: SnapshotStore + ?Sized,
{
    let snapshots = store.list().await?;
    let classification = classify_from_newest(snapshots, policy);
    for warning in &classification.warnings {
        match warning {
            PolicyWarning::OverlappingTier { tier, snapshot, reason } => {
                tracing::warn!(%tier, %snapshot, %reason, "tier picked a snapshot it already kept, overlapping tiers?");
            }
            PolicyWarning::DuplicateName { snapshot } => {
                tracing::warn!(%snapshot, "store listed the same snapshot twice");
            }
        }
    }
    Ok(classification)
}

async fn usage_or_zero<S>(store: &S, snapshot: &Snapshot) -> SnapshotUsage
where
    S: SnapshotStore + ?Sized,
{
    store.usage(snapshot).await.unwrap_or_else(|e| {
        tracing::warn!(snapshot = snapshot.name(), error = %e, "failed to read snapshot size");
        SnapshotUsage::default()
    })
}

/// Applies `policy` to `store`, deleting unkept snapshots unless `dry_run`.
///
/// # Errors
///
/// Returns [`StoreError`] if the store cannot be listed. Individual delete
/// failures are counted in [`PruneReport::failed`] instead.
#[tracing::instrument(name = "prune", skip_all, fields(store = store.kind(), dry_run = dry_run))]
pub async fn prune<S>(store: &S, policy: &RetentionPolicy, dry_run: bool) -> Result<PruneReport, StoreError>
where
    S: SnapshotStore + ?Sized,
{
    let Classification {
        keep,
        remove,
        warnings,
    } = plan(store, policy).await?;

    if keep.is_empty() && remove.is_empty() {
        tracing::info!("no snapshots to prune");
        return Ok(PruneReport {
            warnings,
            ..PruneReport::default()
        });
    }

    let mut report = PruneReport {
        kept: keep.len(),
        warnings,
        ..PruneReport::default()
    };

    tracing::info!(count = keep.len(), "keeping snapshots");
    for snapshot in &keep {
        tracing::debug!(snapshot = snapshot.name(), reason = %snapshot.reason(), "keep");
        let usage = usage_or_zero(store, snapshot).await;
        report.space_kept += usage.space_used;
        report.size_kept += usage.logical_size;
    }
    tracing::info!(
        space = %format_bytes(report.space_kept),
        size = %format_bytes(report.size_kept),
        count = report.kept,
        "space used by kept snapshots"
    );

    if dry_run {
        report.would_remove = remove.len();
        tracing::info!(count = remove.len(), "dry run, would remove snapshots");
        for snapshot in &remove {
            tracing::debug!(snapshot = snapshot.name(), "would remove");
        }
        return Ok(report);
    }

    tracing::info!(count = remove.len(), "removing snapshots");
    for snapshot in &remove {
        let usage = usage_or_zero(store, snapshot).await;
        tracing::debug!(
            snapshot = snapshot.name(),
            space = %format_bytes(usage.space_used),
            size = %format_bytes(usage.logical_size),
            "deleting"
        );

        match store.delete(snapshot).await {
            Ok(()) => {
                report.removed += 1;
                report.space_saved += usage.space_used;
                report.size_saved += usage.logical_size;
            }
            Err(e) => {
                tracing::warn!(snapshot = snapshot.name(), error = %e, "failed to delete snapshot");
                report.failed += 1;
            }
        }
    }

    if report.failed > 0 {
        tracing::error!(count = report.failed, "failed to delete snapshots");
    }
    tracing::info!(
        space = %format_bytes(report.space_saved),
        size = %format_bytes(report.size_saved),
        count = report.removed,
        "pruned snapshots"
    );

    Ok(report)
}
