//! Retention classifier.
//!
//! Partitions a snapshot collection into the snapshots to keep and the ones
//! to remove under a grandfather-father-son policy. Classification is pure
//! and stateless: it depends only on the snapshots, the anchor time and the
//! policy, and incoming reason tags are cleared before it starts.
//!
//! # Algorithm
//!
//! 1. Every snapshot at the anchor or newer than `anchor - keep_for` is kept
//!    and tagged `Recent`.
//! 2. For each tier, finest first, windows `(step(anchor, k + 1),
//!    step(anchor, k)]` are walked backward from the anchor. The most recent
//!    non-recent snapshot in each window becomes its representative and gains
//!    the tier's tag. Empty windows are skipped without counting.
//! 3. A tier stops after `cap` representatives, once a window ends before
//!    the oldest snapshot, or when no candidates remain.
//!
//! ```text
//!  oldest                                          anchor
//!    │   ...   │  day 2  │  day 1  │ ─ recent window ─ │
//!    ▼         ▼         ▼         ▼                   ▼
//!    ●  ●   ●  ●   ●  ●  ● ● ●  ●  ● ● ● ● ● ● ● ● ● ● ●
//!              ^ rep     ^ rep
//! ```
//!
//! Anchoring to the newest snapshot rather than the wall clock means a
//! long outage never turns into a mass deletion.

use chrono::{DateTime, Utc};

use crate::policy::RetentionPolicy;
use crate::snapshot::{Reason, Snapshot};
use crate::tier::TierSpec;

/// Non-fatal policy diagnostics produced during classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyWarning {
    /// A tier picked a representative that already carries its tag, which
    /// means two tiers produce overlapping windows.
    OverlappingTier {
        /// Label of the tier that made the pick.
        tier: String,
        /// The snapshot picked twice.
        snapshot: String,
        /// The snapshot's reasons at the time of the pick.
        reason: Reason,
    },
    /// The same snapshot name appeared more than once in the input.
    DuplicateName {
        /// The repeated name.
        snapshot: String,
    },
}

/// Result of [`classify`]: an exact partition of the input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Snapshots to retain, oldest first, with their reasons filled in.
    pub keep: Vec<Snapshot>,
    /// Snapshots to delete, oldest first.
    pub remove: Vec<Snapshot>,
    /// Diagnostics worth surfacing to the operator.
    pub warnings: Vec<PolicyWarning>,
}

impl Classification {
    /// Total number of snapshots classified.
    pub fn len(&self) -> usize {
        self.keep.len() + self.remove.len()
    }

    /// Returns `true` if nothing was classified.
    pub fn is_empty(&self) -> bool {
        self.keep.is_empty() && self.remove.is_empty()
    }
}

/// Classifies `snapshots` against `policy`, computing windows back from
/// `anchor`.
///
/// The input may be unsorted. Empty input yields an empty classification.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use chrono::{TimeZone, Utc};
/// use snapkeep::{classify, RetentionPolicy, Snapshot};
///
/// let anchor = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
/// let old = Snapshot::new("old", Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap());
/// let new = Snapshot::new("new", anchor);
///
/// let policy = RetentionPolicy::new(Duration::from_secs(3600), vec![])?;
/// let result = classify(vec![old, new], anchor, &policy);
///
/// assert_eq!(result.keep.len(), 1);
/// assert_eq!(result.remove[0].name(), "old");
/// # Ok::<(), snapkeep::error::ConfigError>(())
/// ```
pub fn classify<I>(snapshots: I, anchor: DateTime<Utc>, policy: &RetentionPolicy) -> Classification
where
    I: IntoIterator<Item = Snapshot>,
{
    let mut warnings = Vec::new();
    let mut all = dedup_by_name(snapshots, &mut warnings);
    if all.is_empty() {
        return Classification {
            warnings,
            ..Classification::default()
        };
    }
    all.sort();

    let mut kept = vec![false; all.len()];

    // `None` means the window reaches past the representable range.
    let recent_start = anchor.checked_sub_signed(policy.keep_for());
    let is_recent =
        |when: DateTime<Utc>| when == anchor || recent_start.is_none_or(|start| when > start);
    // The recent start is never after the anchor, so recent snapshots form a
    // suffix of the sorted list and everything before it is a tier candidate.
    let candidates = all.partition_point(|s| !is_recent(s.created_at()));
    for snapshot in &mut all[candidates..] {
        snapshot.add_reason(Reason::RECENT);
    }
    kept[candidates..].fill(true);
    tracing::debug!(
        count = all.len() - candidates,
        keep_for = %policy.keep_for(),
        "recent snapshots"
    );

    for tier in policy.tiers() {
        let selected = sweep_tier(tier, anchor, &mut all, candidates, &mut kept, &mut warnings);
        tracing::debug!(
            tier = %tier.label,
            selected,
            cap = tier.cap,
            "tier swept"
        );
    }

    let mut keep = Vec::new();
    let mut remove = Vec::new();
    for (snapshot, kept) in all.into_iter().zip(kept) {
        if kept {
            keep.push(snapshot);
        } else {
            remove.push(snapshot);
        }
    }

    Classification {
        keep,
        remove,
        warnings,
    }
}

/// Classifies against the newest snapshot in the collection.
///
/// This is the anchor a retention run uses; the newest snapshot is therefore
/// always kept.
pub fn classify_from_newest(snapshots: Vec<Snapshot>, policy: &RetentionPolicy) -> Classification {
    match snapshots.iter().map(Snapshot::created_at).max() {
        Some(anchor) => classify(snapshots, anchor, policy),
        None => Classification::default(),
    }
}

fn dedup_by_name<I>(snapshots: I, warnings: &mut Vec<PolicyWarning>) -> Vec<Snapshot>
where
    I: IntoIterator<Item = Snapshot>,
{
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::new();
    for mut snapshot in snapshots {
        if !seen.insert(snapshot.name().to_string()) {
            warnings.push(PolicyWarning::DuplicateName {
                snapshot: snapshot.name().to_string(),
            });
            continue;
        }
        snapshot.set_reason(Reason::UNKNOWN);
        unique.push(snapshot);
    }
    unique
}

/// Walks one tier's windows back from the anchor. Returns how many
/// representatives counted toward the cap.
fn sweep_tier(
    tier: &TierSpec,
    anchor: DateTime<Utc>,
    all: &mut [Snapshot],
    candidates: usize,
    kept: &mut [bool],
    warnings: &mut Vec<PolicyWarning>,
) -> u32 {
    let oldest = all[0].created_at();
    let mut selected = 0;
    let mut k: u32 = 0;

    while selected < tier.cap {
        let Some(window_end) = tier.step(anchor, k) else {
            break;
        };
        if window_end < oldest {
            break;
        }
        let Some(next_k) = k.checked_add(1) else {
            break;
        };
        let window_start = tier.step(anchor, next_k);

        match representative(&all[..candidates], window_start, window_end) {
            Pick::Found(i) => {
                let snapshot = &mut all[i];
                tracing::trace!(
                    tier = %tier.label,
                    start = ?window_start,
                    end = %window_end,
                    snapshot = snapshot.name(),
                    "latest in window"
                );
                if snapshot.reason().contains(tier.reason) {
                    tracing::debug!(
                        tier = %tier.label,
                        snapshot = snapshot.name(),
                        reason = %snapshot.reason(),
                        "adding keep entry for same reason, overlapping tiers?"
                    );
                    warnings.push(PolicyWarning::OverlappingTier {
                        tier: tier.label.clone(),
                        snapshot: snapshot.name().to_string(),
                        reason: snapshot.reason(),
                    });
                } else {
                    selected += 1;
                }
                snapshot.add_reason(tier.reason);
                kept[i] = true;
            }
            Pick::EmptyWindow => {
                tracing::trace!(
                    tier = %tier.label,
                    start = ?window_start,
                    end = %window_end,
                    "no snapshots in window"
                );
            }
            Pick::Exhausted => break,
        }

        k = next_k;
    }

    selected
}

enum Pick {
    Found(usize),
    EmptyWindow,
    /// No candidate at or before the window end.
    Exhausted,
}

/// Finds the most recent candidate in `(start, end]`.
///
/// `candidates` holds the non-recent snapshots sorted ascending, so only the
/// last one not after `end` needs checking.
fn representative(
    candidates: &[Snapshot],
    start: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
) -> Pick {
    let upper = candidates.partition_point(|s| s.created_at() <= end);
    let Some(latest) = upper.checked_sub(1).map(|i| &candidates[i]) else {
        return Pick::Exhausted;
    };
    if start.is_none_or(|start| latest.created_at() > start) {
        Pick::Found(upper - 1)
    } else {
        Pick::EmptyWindow
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeDelta, TimeZone};

    use super::*;
    use crate::policy::PruneConfig;
    use crate::tier::{TierUnit, standard_tiers};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn hourly(hours: impl IntoIterator<Item = i64>) -> Vec<Snapshot> {
        hours
            .into_iter()
            .map(|h| Snapshot::new(format!("h{h:03}"), base() + TimeDelta::hours(h)))
            .collect()
    }

    fn names(snapshots: &[Snapshot]) -> Vec<&str> {
        snapshots.iter().map(Snapshot::name).collect()
    }

    fn policy(keep_for_hours: u64, caps: [u32; 5]) -> RetentionPolicy {
        PruneConfig {
            keep_for: Duration::from_secs(keep_for_hours * 3600),
            keep_hourly: caps[0],
            keep_daily: caps[1],
            keep_weekly: caps[2],
            keep_monthly: caps[3],
            keep_yearly: caps[4],
        }
        .to_policy()
        .unwrap()
    }

    #[test]
    fn test_empty_input() {
        let result = classify(Vec::new(), base(), &RetentionPolicy::default());
        assert!(result.is_empty());
        assert!(result.warnings.is_empty());
        assert!(classify_from_newest(Vec::new(), &RetentionPolicy::default()).is_empty());
    }

    #[test]
    fn test_hourly_scenario() {
        let snapshots = hourly(0..=30);
        let anchor = base() + TimeDelta::hours(30);

        let result = classify(snapshots, anchor, &policy(24, [2, 0, 0, 0, 0]));

        let recent: Vec<_> = result
            .keep
            .iter()
            .filter(|s| s.reason().contains(Reason::RECENT))
            .collect();
        assert_eq!(recent.len(), 24);
        assert_eq!(recent[0].name(), "h007");

        let hourly: Vec<_> = result
            .keep
            .iter()
            .filter(|s| s.reason().contains(Reason::HOURLY))
            .map(Snapshot::name)
            .collect();
        assert_eq!(hourly, vec!["h005", "h006"]);

        assert_eq!(names(&result.remove), vec!["h000", "h001", "h002", "h003", "h004"]);
        assert_eq!(result.len(), 31);
    }

    #[test]
    fn test_zero_caps_keep_only_recent() {
        let snapshots = hourly(0..48);
        let anchor = base() + TimeDelta::hours(47);

        let result = classify(snapshots, anchor, &policy(10, [0, 0, 0, 0, 0]));
        assert_eq!(result.keep.len(), 10);
        assert!(result.keep.iter().all(|s| s.reason() == Reason::RECENT));
        assert_eq!(result.remove.len(), 38);
    }

    #[test]
    fn test_anchor_is_kept_with_zero_window() {
        let snapshots = hourly([0, 5, 9]);
        let anchor = base() + TimeDelta::hours(9);

        let result = classify(snapshots, anchor, &policy(0, [0, 0, 0, 0, 0]));
        assert_eq!(names(&result.keep), vec!["h009"]);
        assert_eq!(names(&result.remove), vec!["h000", "h005"]);
    }

    #[test]
    fn test_unsorted_input_gives_sorted_output() {
        let mut snapshots = hourly(0..10);
        snapshots.reverse();
        let anchor = base() + TimeDelta::hours(9);

        let result = classify(snapshots, anchor, &policy(3, [2, 0, 0, 0, 0]));
        assert_eq!(names(&result.keep), vec!["h005", "h006", "h007", "h008", "h009"]);
        assert_eq!(names(&result.remove), vec!["h000", "h001", "h002", "h003", "h004"]);
    }

    #[test]
    fn test_daily_picks_latest_per_day() {
        // Four snapshots a day for five days.
        let snapshots = hourly((0..5).flat_map(|d| [0, 6, 12, 18].map(|h| d * 24 + h)));
        let anchor = base() + TimeDelta::hours(4 * 24 + 18);

        let result = classify(snapshots, anchor, &policy(0, [0, 3, 0, 0, 0]));

        let daily: Vec<_> = result
            .keep
            .iter()
            .filter(|s| s.reason().contains(Reason::DAILY))
            .map(Snapshot::name)
            .collect();
        // Windows are anchored at 18:00 on day 4, so each window ends at 18:00
        // and the anchor itself is recent.
        assert_eq!(daily, vec!["h066", "h090", "h108"]);
        assert_eq!(result.keep.len(), 4);
    }

    #[test]
    fn test_tags_accumulate_across_tiers() {
        // One snapshot a day for sixty days.
        let snapshots: Vec<_> = (0..60)
            .map(|d| Snapshot::new(format!("d{d:02}"), base() + TimeDelta::days(d)))
            .collect();
        let anchor = base() + TimeDelta::days(59);

        let result = classify(snapshots, anchor, &policy(0, [0, 7, 4, 2, 0]));

        let d52 = result.keep.iter().find(|s| s.name() == "d52").unwrap();
        assert!(d52.reason().contains(Reason::DAILY));
        assert!(d52.reason().contains(Reason::WEEKLY));
        assert!(result.warnings.is_empty());

        for (reason, cap) in [(Reason::DAILY, 7), (Reason::WEEKLY, 4), (Reason::MONTHLY, 2)] {
            let count = result.keep.iter().filter(|s| s.reason().contains(reason)).count();
            assert_eq!(count, cap, "{reason}");
        }
    }

    #[test]
    fn test_gaps_do_not_consume_cap() {
        // Snapshots only every third hour.
        let snapshots = hourly((0..10).map(|i| i * 3));
        let anchor = base() + TimeDelta::hours(27);

        let result = classify(snapshots, anchor, &policy(0, [3, 0, 0, 0, 0]));
        assert_eq!(names(&result.keep), vec!["h018", "h021", "h024", "h027"]);
    }

    #[test]
    fn test_overlapping_tiers_warn() {
        let snapshots = hourly(0..6);
        let anchor = base() + TimeDelta::hours(5);
        let tiers = vec![TierSpec::new(TierUnit::Hour, 2), TierSpec::new(TierUnit::Hour, 3)];
        let policy = RetentionPolicy::new(Duration::ZERO, tiers).unwrap();

        let result = classify(snapshots, anchor, &policy);

        // The second tier re-picks h004 and h003 without counting them.
        assert_eq!(result.warnings.len(), 2);
        assert!(matches!(
            &result.warnings[0],
            PolicyWarning::OverlappingTier { snapshot, .. } if snapshot == "h004"
        ));
        let hourly = result.keep.iter().filter(|s| s.reason().contains(Reason::HOURLY)).count();
        assert_eq!(hourly, 5);
        assert!(result.remove.is_empty());
    }

    #[test]
    fn test_long_recent_run_before_tier_candidates() {
        // Two weeks of minutely snapshots, all inside a one-month recent
        // window, on top of hourly history from the month before.
        let anchor = base() + TimeDelta::days(45);
        let mut snapshots: Vec<_> = (0..14 * 24 * 60)
            .map(|m| Snapshot::new(format!("m{m:05}"), anchor - TimeDelta::minutes(m)))
            .collect();
        snapshots.extend((0..30 * 24).map(|h| {
            Snapshot::new(format!("old{h:03}"), base() + TimeDelta::hours(h))
        }));
        let policy = RetentionPolicy::new(
            Duration::from_secs(30 * 24 * 3600),
            vec![TierSpec::new(TierUnit::Hour, 3), TierSpec::new(TierUnit::Day, 2)],
        )
        .unwrap();

        let result = classify(snapshots, anchor, &policy);

        let recent = result.keep.iter().filter(|s| s.reason() == Reason::RECENT).count();
        assert_eq!(recent, 14 * 24 * 60);
        let tiered: Vec<_> = result
            .keep
            .iter()
            .filter(|s| !s.reason().contains(Reason::RECENT))
            .map(|s| (s.name(), s.reason()))
            .collect();
        assert_eq!(
            tiered,
            vec![
                ("old696", Reason::DAILY),
                ("old717", Reason::HOURLY),
                ("old718", Reason::HOURLY),
                ("old719", Reason::HOURLY | Reason::DAILY),
            ]
        );
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_incoming_tags_are_cleared() {
        let mut snapshots = hourly(0..3);
        snapshots[0].set_reason(Reason::YEARLY | Reason::HOURLY);
        let anchor = base() + TimeDelta::hours(2);

        let result = classify(snapshots, anchor, &policy(1, [0, 0, 0, 0, 0]));
        assert!(result.remove.iter().all(|s| s.reason().is_unknown()));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_identical_timestamps_are_not_merged() {
        let t = base();
        let snapshots = vec![
            Snapshot::new("a", t),
            Snapshot::new("b", t),
            Snapshot::new("c", t + TimeDelta::hours(10)),
        ];
        let anchor = t + TimeDelta::hours(10);

        let result = classify(snapshots, anchor, &policy(0, [5, 0, 0, 0, 0]));
        assert_eq!(names(&result.keep), vec!["b", "c"]);
        assert_eq!(names(&result.remove), vec!["a"]);
    }

    #[test]
    fn test_duplicate_names_are_reported() {
        let mut snapshots = hourly(0..2);
        snapshots.push(snapshots[0].clone());
        let anchor = base() + TimeDelta::hours(1);

        let result = classify(snapshots, anchor, &policy(24, [0, 0, 0, 0, 0]));
        assert_eq!(result.len(), 2);
        assert_eq!(
            result.warnings,
            vec![PolicyWarning::DuplicateName {
                snapshot: "h000".to_string()
            }]
        );
    }

    #[test]
    fn test_anchor_before_newest_keeps_newer() {
        let snapshots = hourly(0..10);
        let anchor = base() + TimeDelta::hours(5);

        let result = classify(snapshots, anchor, &policy(1, [0, 0, 0, 0, 0]));
        assert_eq!(names(&result.keep), vec!["h005", "h006", "h007", "h008", "h009"]);
    }

    #[test]
    fn test_standard_tiers_over_years() {
        // Daily snapshots for three years.
        let snapshots: Vec<_> = (0..3 * 365)
            .map(|d| Snapshot::new(format!("d{d:04}"), base() + TimeDelta::days(d)))
            .collect();
        let policy = RetentionPolicy::new(Duration::from_secs(24 * 3600), standard_tiers(12, 7, 4, 6, 5))
            .unwrap();

        let result = classify_from_newest(snapshots, &policy);

        let yearly = result.keep.iter().filter(|s| s.reason().contains(Reason::YEARLY)).count();
        // Windows reaching back to the oldest snapshot: three full years.
        assert_eq!(yearly, 3);
        assert!(result.keep.len() <= 1 + 12 + 7 + 4 + 6 + 5);
        assert_eq!(result.len(), 3 * 365);
    }
}
