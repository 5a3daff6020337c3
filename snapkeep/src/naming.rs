//! Snapshot naming: `prefix + strftime(format)`.
//!
//! Names are generated from a timestamp and parsed back into one when a store
//! lists its contents, so parsing must be the exact inverse of generation.
//! [`SnapshotNaming::new`] rejects formats that cannot round-trip.

use std::fmt::Write;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, NamingError};

/// Default prefix identifying managed snapshots.
pub const DEFAULT_PREFIX: &str = "mcb-";

/// Default date format (`2024-01-31-13:45`).
pub const DEFAULT_FORMAT: &str = "%F-%H:%M";

/// Generates and parses snapshot names. Timestamps are interpreted as UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNaming {
    prefix: String,
    format: String,
}

impl SnapshotNaming {
    /// Creates a naming scheme after checking the format round-trips.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidNameFormat`] if the format contains an
    /// invalid specifier or its output cannot be parsed back.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapkeep::naming::SnapshotNaming;
    ///
    /// assert!(SnapshotNaming::new("mcb-", "%F-%H:%M").is_ok());
    /// assert!(SnapshotNaming::new("mcb-", "%Q").is_err());
    /// ```
    pub fn new(prefix: impl Into<String>, format: impl Into<String>) -> Result<Self, ConfigError> {
        let naming = Self {
            prefix: prefix.into(),
            format: format.into(),
        };
        naming.validate()?;
        Ok(naming)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidNameFormat {
            format: self.format.clone(),
            reason,
        };

        if self.format.is_empty() {
            return Err(invalid("format is empty".to_string()));
        }
        if StrftimeItems::new(&self.format).any(|item| matches!(item, Item::Error)) {
            return Err(invalid("unknown specifier".to_string()));
        }

        let sample = Utc
            .with_ymd_and_hms(2001, 2, 3, 4, 5, 6)
            .single()
            .ok_or_else(|| invalid("sample timestamp out of range".to_string()))?;
        let name = self.generate(sample).map_err(|e| invalid(e.to_string()))?;
        let parsed = self.parse(&name).map_err(|e| invalid(e.to_string()))?;
        let regenerated = self.generate(parsed).map_err(|e| invalid(e.to_string()))?;
        if regenerated != name {
            return Err(invalid(format!(
                "'{name}' parses back to '{regenerated}'"
            )));
        }
        Ok(())
    }

    /// The managed-name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The strftime format.
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Renders the name for a snapshot taken at `when`.
    ///
    /// # Errors
    ///
    /// Returns [`NamingError::Format`] if chrono cannot render the timestamp.
    pub fn generate(&self, when: DateTime<Utc>) -> Result<String, NamingError> {
        let mut name = self.prefix.clone();
        write!(name, "{}", when.format(&self.format)).map_err(|_| NamingError::Format {
            format: self.format.clone(),
        })?;
        Ok(name)
    }

    /// Parses a name produced by [`generate`](Self::generate) back into its
    /// timestamp. Formats with no time-of-day parse to midnight.
    ///
    /// # Errors
    ///
    /// Returns [`NamingError`] if the prefix is missing or the rest does not
    /// match the format.
    pub fn parse(&self, name: &str) -> Result<DateTime<Utc>, NamingError> {
        let rest = name
            .strip_prefix(&self.prefix)
            .ok_or_else(|| NamingError::MissingPrefix {
                name: name.to_string(),
                prefix: self.prefix.clone(),
            })?;

        match NaiveDateTime::parse_from_str(rest, &self.format) {
            Ok(naive) => Ok(naive.and_utc()),
            Err(datetime_err) => NaiveDate::parse_from_str(rest, &self.format)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
                .ok_or_else(|| NamingError::Unparseable {
                    name: name.to_string(),
                    format: self.format.clone(),
                    source: datetime_err,
                }),
        }
    }

    /// Returns `true` if `name` carries the managed prefix.
    pub fn is_managed(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }
}

impl Default for SnapshotNaming {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            format: DEFAULT_FORMAT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trip() {
        let naming = SnapshotNaming::default();
        let when = Utc.with_ymd_and_hms(2024, 3, 9, 17, 45, 0).unwrap();

        let name = naming.generate(when).unwrap();
        assert_eq!(name, "mcb-2024-03-09-17:45");
        assert_eq!(naming.parse(&name).unwrap(), when);
    }

    #[test]
    fn test_seconds_are_dropped_by_minute_format() {
        let naming = SnapshotNaming::default();
        let when = Utc.with_ymd_and_hms(2024, 3, 9, 17, 45, 31).unwrap();

        let parsed = naming.parse(&naming.generate(when).unwrap()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 9, 17, 45, 0).unwrap());
    }

    #[test]
    fn test_date_only_format_parses_to_midnight() {
        let naming = SnapshotNaming::new("daily_", "%Y%m%d").unwrap();
        let when = Utc.with_ymd_and_hms(2023, 12, 31, 22, 0, 0).unwrap();

        let name = naming.generate(when).unwrap();
        assert_eq!(name, "daily_20231231");
        assert_eq!(
            naming.parse(&name).unwrap(),
            Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_rejects_formats_that_do_not_round_trip() {
        assert!(SnapshotNaming::new("mcb-", "").is_err());
        assert!(SnapshotNaming::new("mcb-", "%Q").is_err());
        // Month name alone loses the year and day.
        assert!(SnapshotNaming::new("mcb-", "%B").is_err());
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        let naming = SnapshotNaming::default();

        assert!(matches!(
            naming.parse("other-2024-03-09-17:45"),
            Err(NamingError::MissingPrefix { .. })
        ));
        assert!(matches!(
            naming.parse("mcb-latest"),
            Err(NamingError::Unparseable { .. })
        ));
        assert!(naming.is_managed("mcb-anything"));
        assert!(!naming.is_managed("world"));
    }
}
