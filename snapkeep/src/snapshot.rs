//! Snapshot records and retention reason tags.
//!
//! A [`Snapshot`] is an immutable identity (name and creation time) plus a
//! mutable [`Reason`] set that the retention classifier fills in. Stores
//! construct snapshots when they list or create; nothing else does.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Set of reasons a snapshot is retained.
///
/// Reasons accumulate with union: a snapshot can be the daily and the weekly
/// representative at once. The empty set displays as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Reason(u8);

impl Reason {
    /// No reason recorded (a snapshot that was never classified).
    pub const UNKNOWN: Self = Self(0);
    /// Inside the recent window.
    pub const RECENT: Self = Self(1 << 0);
    /// Representative of an hourly window.
    pub const HOURLY: Self = Self(1 << 1);
    /// Representative of a daily window.
    pub const DAILY: Self = Self(1 << 2);
    /// Representative of a weekly window.
    pub const WEEKLY: Self = Self(1 << 3);
    /// Representative of a monthly window.
    pub const MONTHLY: Self = Self(1 << 4);
    /// Representative of a yearly window.
    pub const YEARLY: Self = Self(1 << 5);

    const NAMED: [(Self, &'static str); 6] = [
        (Self::RECENT, "Recent"),
        (Self::HOURLY, "Hourly"),
        (Self::DAILY, "Daily"),
        (Self::WEEKLY, "Weekly"),
        (Self::MONTHLY, "Monthly"),
        (Self::YEARLY, "Yearly"),
    ];

    /// Returns `true` if no reason is set.
    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every flag in `other` is also set in `self`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapkeep::Reason;
    ///
    /// let reason = Reason::DAILY | Reason::WEEKLY;
    /// assert!(reason.contains(Reason::DAILY));
    /// assert!(!reason.contains(Reason::HOURLY));
    /// ```
    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Returns `true` if `self` and `other` share at least one flag.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Reason {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Reason {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return f.write_str("Unknown");
        }
        let mut first = true;
        for (flag, name) in Self::NAMED {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A point-in-time copy of the managed data.
///
/// Identity is the name; two snapshots with the same creation time are still
/// distinct. Ordering is by creation time, then name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot {
    name: String,
    created_at: DateTime<Utc>,
    reason: Reason,
}

impl Snapshot {
    /// Creates an unclassified snapshot record.
    pub fn new(name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            created_at,
            reason: Reason::UNKNOWN,
        }
    }

    /// The snapshot's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the snapshot was taken.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current retention reasons.
    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// Unions `reason` into the current set.
    pub fn add_reason(&mut self, reason: Reason) {
        self.reason |= reason;
    }

    /// Overwrites the reason set.
    pub fn set_reason(&mut self, reason: Reason) {
        self.reason = reason;
    }
}

impl Ord for Snapshot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for Snapshot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Disk usage of a snapshot, used for reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotUsage {
    /// Bytes the snapshot occupies on disk.
    pub space_used: u64,
    /// Logical (uncompressed or referenced) size in bytes.
    pub logical_size: u64,
}
