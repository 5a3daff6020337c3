//! ZFS snapshot backend.
//!
//! Drives the `zfs` command line tool. Snapshots are `dataset@name`; only
//! direct snapshots of the configured dataset with a managed name are
//! listed.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::SnapshotStore;
use crate::error::{ConfigError, StoreError};
use crate::naming::SnapshotNaming;
use crate::prune::format_bytes;
use crate::snapshot::{Snapshot, SnapshotUsage};

fn default_binary() -> PathBuf {
    PathBuf::from("zfs")
}

/// Configuration for [`ZfsStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZfsConfig {
    /// Dataset or volume to snapshot, e.g. `tank/minecraft`.
    pub dataset: String,
    /// Snapshot and destroy descendant datasets too.
    #[serde(default)]
    pub recursive: bool,
    /// Path to the `zfs` binary.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
}

impl ZfsConfig {
    /// Creates a non-recursive configuration using `zfs` from `PATH`.
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            recursive: false,
            binary: default_binary(),
        }
    }

    /// Validates the dataset name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDataset`] if the name is empty or
    /// names a snapshot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDataset {
            dataset: self.dataset.clone(),
            reason: reason.to_string(),
        };
        if self.dataset.is_empty() {
            return Err(invalid("dataset name is empty"));
        }
        if self.dataset.contains('@') {
            return Err(invalid("expected a dataset, not a snapshot"));
        }
        if self.dataset.starts_with('/') || self.dataset.ends_with('/') {
            return Err(invalid("dataset names do not start or end with '/'"));
        }
        Ok(())
    }
}

/// Snapshots of a ZFS dataset.
#[derive(Debug, Clone)]
pub struct ZfsStore {
    config: ZfsConfig,
    naming: SnapshotNaming,
}

impl ZfsStore {
    /// Creates the store after validating the configuration. No command is
    /// run; see [`check`](Self::check).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: ZfsConfig, naming: SnapshotNaming) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, naming })
    }

    /// Verifies the dataset exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if `zfs` cannot be run or the dataset is
    /// missing.
    pub async fn check(&self) -> Result<(), StoreError> {
        self.zfs(&["list", "-H", "-o", "name", &self.config.dataset])
            .await
            .map(|_| ())
    }

    fn snapshot_path(&self, name: &str) -> String {
        format!("{}@{name}", self.config.dataset)
    }

    async fn zfs(&self, args: &[&str]) -> Result<String, StoreError> {
        let command = format!("{} {}", self.config.binary.display(), args.join(" "));
        tracing::debug!(%command, "running zfs");

        let output = Command::new(&self.config.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| StoreError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(StoreError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout).map_err(|e| StoreError::Parse {
            reason: format!("non-UTF-8 output from `{command}`: {e}"),
        })
    }
}

/// Parses `zfs list -H -p -o name,used,referenced` output.
///
/// Snapshots of other datasets and names without the managed prefix are
/// skipped; managed names that do not parse are skipped with a warning.
///
/// # Errors
///
/// Returns [`StoreError::Parse`] if a line does not have three fields or a
/// size is not a number.
pub fn parse_list_output(
    output: &str,
    dataset: &str,
    naming: &SnapshotNaming,
) -> Result<Vec<(Snapshot, SnapshotUsage)>, StoreError> {
    let mut snapshots = Vec::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let [full_name, used, referenced] = fields.as_slice() else {
            return Err(StoreError::Parse {
                reason: format!("expected 3 tab-separated fields, got '{line}'"),
            });
        };

        let Some((parent, name)) = full_name.split_once('@') else {
            continue;
        };
        if parent != dataset {
            tracing::debug!(snapshot = full_name, "skipping snapshot of another dataset");
            continue;
        }
        if !naming.is_managed(name) {
            continue;
        }
        let when = match naming.parse(name) {
            Ok(when) => when,
            Err(e) => {
                tracing::warn!(snapshot = full_name, error = %e, "skipping unparseable snapshot");
                continue;
            }
        };

        let usage = SnapshotUsage {
            space_used: parse_size(used, full_name)?,
            logical_size: parse_size(referenced, full_name)?,
        };
        snapshots.push((Snapshot::new(name, when), usage));
    }

    snapshots.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(snapshots)
}

fn parse_size(value: &str, snapshot: &str) -> Result<u64, StoreError> {
    value.trim().parse().map_err(|_| StoreError::Parse {
        reason: format!("invalid size '{value}' for {snapshot}"),
    })
}

#[async_trait]
impl SnapshotStore for ZfsStore {
    fn kind(&self) -> &'static str {
        "zfs"
    }

    #[tracing::instrument(name = "zfs", skip(self, when), fields(dataset = %self.config.dataset))]
    async fn create(&self, name: &str, when: DateTime<Utc>) -> Result<Snapshot, StoreError> {
        let path = self.snapshot_path(name);
        tracing::info!(snapshot = %path, "taking zfs snapshot");

        let mut args = vec!["snapshot"];
        if self.config.recursive {
            args.push("-r");
        }
        args.push(&path);
        self.zfs(&args).await?;

        let snapshot = Snapshot::new(name, when);
        match self.usage(&snapshot).await {
            Ok(usage) => tracing::info!(
                snapshot = %path,
                referenced = %format_bytes(usage.logical_size),
                "snapshot created"
            ),
            Err(e) => tracing::warn!(snapshot = %path, error = %e, "snapshot created, size unavailable"),
        }
        Ok(snapshot)
    }

    async fn list(&self) -> Result<Vec<Snapshot>, StoreError> {
        let output = self
            .zfs(&[
                "list",
                "-H",
                "-p",
                "-t",
                "snapshot",
                "-o",
                "name,used,referenced",
                "-d",
                "1",
                &self.config.dataset,
            ])
            .await?;
        let parsed = parse_list_output(&output, &self.config.dataset, &self.naming)?;
        Ok(parsed.into_iter().map(|(snapshot, _)| snapshot).collect())
    }

    async fn delete(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let path = self.snapshot_path(snapshot.name());
        let mut args = vec!["destroy"];
        if self.config.recursive {
            args.push("-r");
        }
        args.push(&path);

        match self.zfs(&args).await {
            Err(StoreError::CommandFailed { stderr, .. })
                if stderr.contains("could not find") || stderr.contains("does not exist") =>
            {
                Err(StoreError::NotFound {
                    name: snapshot.name().to_string(),
                })
            }
            result => result.map(|_| ()),
        }
    }

    async fn usage(&self, snapshot: &Snapshot) -> Result<SnapshotUsage, StoreError> {
        let path = self.snapshot_path(snapshot.name());
        let output = self
            .zfs(&["get", "-H", "-p", "-o", "value", "used,referenced", &path])
            .await?;

        let mut values = output.lines().map(str::trim).filter(|l| !l.is_empty());
        match (values.next(), values.next()) {
            (Some(used), Some(referenced)) => Ok(SnapshotUsage {
                space_used: parse_size(used, &path)?,
                logical_size: parse_size(referenced, &path)?,
            }),
            _ => Err(StoreError::Parse {
                reason: format!("expected used and referenced for {path}, got '{output}'"),
            }),
        }
    }
}
