//! Retention tier definitions.
//!
//! A tier is a granularity (hour, day, week, month, year) with a cap on how
//! many representatives it keeps. Windows are stepped with calendar
//! arithmetic: a month tier subtracts calendar months, not 30 days, so
//! windows stay aligned to human period boundaries.

use std::fmt;

use chrono::{DateTime, Days, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::Reason;

/// Calendar granularity of a tier, ordered finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierUnit {
    /// One hour.
    Hour,
    /// One calendar day.
    Day,
    /// Seven calendar days.
    Week,
    /// One calendar month.
    Month,
    /// One calendar year.
    Year,
}

impl TierUnit {
    /// Returns the time `n` units before `time`, or `None` if it is out of
    /// range.
    ///
    /// Month and year steps clamp to the last day of a shorter month
    /// (31 March minus one month is 29 or 28 February).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chrono::{TimeZone, Utc};
    /// use snapkeep::tier::TierUnit;
    ///
    /// let t = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
    /// let back = TierUnit::Month.step(t, 1).unwrap();
    /// assert_eq!(back, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());
    /// ```
    pub fn step(self, time: DateTime<Utc>, n: u32) -> Option<DateTime<Utc>> {
        match self {
            Self::Hour => time.checked_sub_signed(TimeDelta::try_hours(i64::from(n))?),
            Self::Day => time.checked_sub_days(Days::new(u64::from(n))),
            Self::Week => time.checked_sub_days(Days::new(u64::from(n) * 7)),
            Self::Month => time.checked_sub_months(Months::new(n)),
            Self::Year => time.checked_sub_months(Months::new(n.checked_mul(12)?)),
        }
    }

    /// The reason tag conventionally attached to this unit.
    pub fn reason(self) -> Reason {
        match self {
            Self::Hour => Reason::HOURLY,
            Self::Day => Reason::DAILY,
            Self::Week => Reason::WEEKLY,
            Self::Month => Reason::MONTHLY,
            Self::Year => Reason::YEARLY,
        }
    }

    /// Lowercase unit name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for TierUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One retention tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    /// Human-readable label, used in logs and warnings.
    pub label: String,
    /// Tag added to each representative this tier selects.
    pub reason: Reason,
    /// Maximum number of representatives.
    pub cap: u32,
    /// Window granularity.
    pub unit: TierUnit,
}

impl TierSpec {
    /// Creates a tier tagged with the unit's conventional reason.
    pub fn new(unit: TierUnit, cap: u32) -> Self {
        Self {
            label: unit.as_str().to_string(),
            reason: unit.reason(),
            cap,
            unit,
        }
    }

    /// Returns the time `n` tier units before `time`.
    pub fn step(&self, time: DateTime<Utc>, n: u32) -> Option<DateTime<Utc>> {
        self.unit.step(time, n)
    }
}

/// Builds the five standard tiers, finest first.
pub fn standard_tiers(hourly: u32, daily: u32, weekly: u32, monthly: u32, yearly: u32) -> Vec<TierSpec> {
    vec![
        TierSpec::new(TierUnit::Hour, hourly),
        TierSpec::new(TierUnit::Day, daily),
        TierSpec::new(TierUnit::Week, weekly),
        TierSpec::new(TierUnit::Month, monthly),
        TierSpec::new(TierUnit::Year, yearly),
    ]
}
