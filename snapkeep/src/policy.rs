//! Retention policy configuration.
//!
//! [`PruneConfig`] is the user-facing shape (five caps plus a recent-window
//! duration), deserializable from any serde format with humantime durations.
//! [`RetentionPolicy`] is the validated form the classifier consumes; it can
//! also carry a custom list of tiers.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tier::{TierSpec, standard_tiers};

/// How many snapshots to keep of each age.
///
/// # Example
///
/// ```rust
/// use snapkeep::policy::PruneConfig;
///
/// let config: PruneConfig = serde_json::from_str(r#"{ "keep_for": "36h", "keep_daily": 14 }"#)?;
/// assert_eq!(config.keep_daily, 14);
/// assert_eq!(config.keep_hourly, 12); // default
///
/// let policy = config.to_policy()?;
/// assert_eq!(policy.tiers().len(), 5);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    /// Keep every snapshot newer than this.
    #[serde(with = "humantime_serde")]
    pub keep_for: Duration,
    /// Number of hourly representatives.
    pub keep_hourly: u32,
    /// Number of daily representatives.
    pub keep_daily: u32,
    /// Number of weekly representatives.
    pub keep_weekly: u32,
    /// Number of monthly representatives.
    pub keep_monthly: u32,
    /// Number of yearly representatives.
    pub keep_yearly: u32,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            keep_for: Duration::from_secs(24 * 3600),
            keep_hourly: 12,
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 6,
            keep_yearly: 5,
        }
    }
}

impl PruneConfig {
    /// Builds the validated policy with the five standard tiers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `keep_for` is out of range.
    pub fn to_policy(&self) -> Result<RetentionPolicy, ConfigError> {
        RetentionPolicy::new(
            self.keep_for,
            standard_tiers(
                self.keep_hourly,
                self.keep_daily,
                self.keep_weekly,
                self.keep_monthly,
                self.keep_yearly,
            ),
        )
    }
}

/// Validated retention policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    keep_for: TimeDelta,
    tiers: Vec<TierSpec>,
}

impl RetentionPolicy {
    /// Creates a policy from a recent-window duration and an ordered tier list.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::KeepForOutOfRange`] if `keep_for` does not fit a
    /// calendar duration, or [`ConfigError::TiersNotOrdered`] if a tier is
    /// finer than the one before it.
    pub fn new(keep_for: Duration, tiers: Vec<TierSpec>) -> Result<Self, ConfigError> {
        let keep_for =
            TimeDelta::from_std(keep_for).map_err(|_| ConfigError::KeepForOutOfRange { duration: keep_for })?;

        // Finer tiers get first claim on boundary snapshots; equal units are
        // allowed and show up as overlap warnings.
        for pair in tiers.windows(2) {
            if pair[1].unit < pair[0].unit {
                return Err(ConfigError::TiersNotOrdered {
                    previous: pair[0].label.clone(),
                    next: pair[1].label.clone(),
                });
            }
        }

        Ok(Self { keep_for, tiers })
    }

    /// Length of the recent window.
    pub fn keep_for(&self) -> TimeDelta {
        self.keep_for
    }

    /// Tiers in sweep order.
    pub fn tiers(&self) -> &[TierSpec] {
        &self.tiers
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        let config = PruneConfig::default();
        Self {
            keep_for: TimeDelta::hours(24),
            tiers: standard_tiers(
                config.keep_hourly,
                config.keep_daily,
                config.keep_weekly,
                config.keep_monthly,
                config.keep_yearly,
            ),
        }
    }
}
