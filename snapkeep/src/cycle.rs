//! One backup cycle: quiesce the server, snapshot, prune, resume.
//!
//! # Order of operations
//!
//! ```text
//! list ─▶ save-off ─▶ save-all ─▶ create ─▶ prune ─▶ save-on
//!   │         │           │          │         │        ▲
//!   └─────────┴───────────┴──────────┴─────────┴────────┘ on any failure
//!   (list gets one reconnect + retry first)
//! ```
//!
//! `save-on` is attempted on every cycle, whatever failed before it, so the
//! server is never left with saving disabled by a failed cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::control::ControlClient;
use crate::error::{Result, SnapkeepError};
use crate::naming::SnapshotNaming;
use crate::policy::RetentionPolicy;
use crate::prune::{PruneReport, prune};
use crate::schedule::Job;
use crate::snapshot::Snapshot;
use crate::store::SnapshotStore;

/// Command used to check the control channel.
pub const CONNECTIVITY_COMMAND: &str = "list";
/// Command that disables automatic saving.
pub const SAVE_OFF_COMMAND: &str = "save-off";
/// Command that flushes pending writes.
pub const SAVE_ALL_COMMAND: &str = "save-all";
/// Command that re-enables automatic saving.
pub const SAVE_ON_COMMAND: &str = "save-on";

/// Switches that change what a cycle does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOptions {
    /// Log the snapshot that would be taken and simulate pruning.
    pub dry_run: bool,
    /// Skip the retention run after creating a snapshot.
    pub no_prune: bool,
}

/// What a successful cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The snapshot taken, unless this was a dry run.
    pub snapshot: Option<Snapshot>,
    /// The retention run, unless pruning was disabled.
    pub prune: Option<PruneReport>,
}

/// Ties a store, a control channel, naming and retention together.
pub struct BackupCycle<S, C> {
    store: S,
    control: C,
    naming: SnapshotNaming,
    policy: RetentionPolicy,
    options: CycleOptions,
}

impl<S: SnapshotStore, C: ControlClient> BackupCycle<S, C> {
    /// Creates a cycle.
    pub fn new(store: S, control: C, naming: SnapshotNaming, policy: RetentionPolicy, options: CycleOptions) -> Self {
        Self {
            store,
            control,
            naming,
            policy,
            options,
        }
    }

    /// The snapshot store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The control client.
    pub fn control(&self) -> &C {
        &self.control
    }

    /// The cycle options.
    pub fn options(&self) -> CycleOptions {
        self.options
    }

    /// Runs one cycle for a snapshot taken at `at`.
    ///
    /// # Errors
    ///
    /// Returns the first failure among the connectivity check, `save-off`,
    /// `save-all`, snapshot creation and the retention listing. If `save-on`
    /// fails as well, both are returned as [`SnapkeepError::Resume`]; a
    /// `save-on` failure alone is returned as is.
    #[tracing::instrument(name = "cycle", skip(self), fields(store = self.store.kind()))]
    pub async fn run_once(&mut self, at: DateTime<Utc>) -> Result<CycleReport> {
        let outcome = match self.check_connection().await {
            Ok(()) => {
                tracing::info!(dry_run = self.options.dry_run, "starting backup");
                self.save_and_snapshot(at).await
            }
            Err(e) => Err(e),
        };
        let resumed = self.command(SAVE_ON_COMMAND).await;

        match (outcome, resumed) {
            (Ok(report), Ok(())) => {
                tracing::info!("backup complete");
                Ok(report)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(cause), Err(resume)) => {
                tracing::error!(error = %resume, "failed to re-enable saving");
                Err(SnapkeepError::Resume {
                    cause: Box::new(cause),
                    resume: Box::new(resume),
                })
            }
        }
    }

    async fn check_connection(&mut self) -> Result<()> {
        if let Err(e) = self.control.send_command(CONNECTIVITY_COMMAND).await {
            tracing::warn!(error = %e, "control channel check failed, reconnecting");
            self.control.reconnect().await?;
            self.control.send_command(CONNECTIVITY_COMMAND).await?;
        }
        Ok(())
    }

    async fn command(&mut self, command: &str) -> Result<()> {
        let response = self.control.send_command(command).await?;
        let response = response.trim();
        if response.is_empty() {
            tracing::debug!(command, "command sent");
        } else {
            tracing::info!(command, response, "command sent");
        }
        Ok(())
    }

    async fn save_and_snapshot(&mut self, at: DateTime<Utc>) -> Result<CycleReport> {
        self.command(SAVE_OFF_COMMAND).await?;
        if let Err(e) = self.command(SAVE_ALL_COMMAND).await {
            tracing::warn!(error = %e, "saving failed, skipping snapshot");
            return Err(e);
        }

        let name = self.naming.generate(at)?;
        // The listed timestamp comes from the name, so record the same one.
        let when = self.naming.parse(&name)?;
        let mut report = CycleReport::default();

        if self.options.dry_run {
            tracing::info!(snapshot = %name, "dry run, not creating snapshot");
        } else {
            let snapshot = self.store.create(&name, when).await?;
            tracing::info!(snapshot = snapshot.name(), "snapshot created");
            report.snapshot = Some(snapshot);
        }

        if !self.options.no_prune {
            report.prune = Some(prune(&self.store, &self.policy, self.options.dry_run).await?);
        }
        Ok(report)
    }
}

#[async_trait]
impl<S, C> Job for BackupCycle<S, C>
where
    S: SnapshotStore + 'static,
    C: ControlClient + 'static,
{
    type Error = SnapkeepError;

    async fn run(&mut self, fired_at: DateTime<Utc>) -> Result<()> {
        self.run_once(fired_at).await.map(|_| ())
    }
}
