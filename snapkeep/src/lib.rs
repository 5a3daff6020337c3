//! # snapkeep
//!
//! Scheduled snapshots of a running server with grandfather-father-son
//! retention.
//!
//! snapkeep quiesces a game server over RCON, snapshots its data directory
//! (as a tar archive or a ZFS snapshot), then thins old snapshots so that a
//! few hourly, daily, weekly, monthly and yearly representatives survive.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Retention is a pure function of the snapshot list and the policy
//! - Windows are anchored at the newest snapshot, so an outage never
//!   triggers a mass deletion
//! - Calendar-aware tiers: a month is a calendar month, not 30 days
//! - Saving is always re-enabled on the server, even after a failed cycle
//! - Cancellation never interrupts a snapshot in progress
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeDelta, TimeZone, Utc};
//! use snapkeep::{PruneConfig, Reason, Snapshot};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = PruneConfig {
//!     keep_hourly: 2,
//!     keep_daily: 0,
//!     keep_weekly: 0,
//!     keep_monthly: 0,
//!     keep_yearly: 0,
//!     ..PruneConfig::default()
//! }
//! .to_policy()?;
//!
//! // A snapshot every hour for 31 hours.
//! let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
//! let snapshots: Vec<_> = (0..=30)
//!     .map(|h| Snapshot::new(format!("mcb-{h}"), start + TimeDelta::hours(h)))
//!     .collect();
//!
//! let result = snapkeep::classify_from_newest(snapshots, &policy);
//!
//! // The last 24 hours are kept, plus two hourly representatives.
//! assert_eq!(result.keep.len(), 26);
//! assert!(result.keep[0].reason().contains(Reason::HOURLY));
//! assert_eq!(result.remove.len(), 5);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`classify`] - Partitions snapshots into keep and remove sets
//! - [`RetentionPolicy`] - Recent window plus ordered tiers
//! - [`SnapshotStore`] - Backend trait: tar, ZFS or in-memory
//! - [`ControlClient`] - Command channel to the server (RCON)
//! - [`BackupCycle`] - One quiesce, snapshot, prune, resume pass
//! - [`Scheduler`] - Cron-driven, cancellable job loop
//!
//! ## Modules
//!
//! - [`snapshot`] - Snapshot records and reason tags
//! - [`naming`] - Snapshot name generation and parsing
//! - [`tier`] - Tier units and calendar stepping
//! - [`policy`] - Retention configuration and validation
//! - [`retention`] - The classifier
//! - [`prune`] - Retention runs against a store
//! - [`store`] - Storage backends
//! - [`control`] - Server control clients
//! - [`cycle`] - The backup cycle
//! - [`schedule`] - Cron scheduling
//! - [`error`] - Error types

pub mod control;
pub mod cycle;
pub mod error;
pub mod naming;
pub mod policy;
pub mod prune;
pub mod retention;
pub mod schedule;
pub mod snapshot;
pub mod store;
pub mod tier;

// Re-export primary API types at crate root for convenience.
pub use control::{ControlClient, RconClient, RconConfig};
pub use cycle::{BackupCycle, CycleOptions, CycleReport};
pub use error::{Result, SnapkeepError};
pub use naming::SnapshotNaming;
pub use policy::{PruneConfig, RetentionPolicy};
pub use prune::{PruneReport, prune};
pub use retention::{Classification, PolicyWarning, classify, classify_from_newest};
pub use schedule::{Completion, Job, Schedule, Scheduler, SchedulerHandle, SchedulerState, run_until_shutdown};
pub use snapshot::{Reason, Snapshot, SnapshotUsage};
pub use store::{MemoryStore, SnapshotStore, TarStore, ZfsStore};
pub use tier::{TierSpec, TierUnit};
