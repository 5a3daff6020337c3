//! End-to-end backup cycles: control channel, store, retention and the
//! scheduler working together.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use snapkeep::error::ControlError;
use snapkeep::schedule::MonotonicClock;
use snapkeep::store::{Compression, TarConfig};
use snapkeep::{
    BackupCycle, Completion, ControlClient, CycleOptions, MemoryStore, PruneConfig, Scheduler, SnapshotNaming,
    SnapshotStore, TarStore, run_until_shutdown,
};
use tempfile::tempdir;

/// Records commands; optionally rejects one of them.
#[derive(Clone, Default)]
struct RecordingControl {
    sent: Arc<Mutex<Vec<String>>>,
    reject: Option<&'static str>,
}

impl RecordingControl {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlClient for RecordingControl {
    async fn send_command(&mut self, command: &str) -> Result<String, ControlError> {
        self.sent.lock().unwrap().push(command.to_string());
        if self.reject == Some(command) {
            return Err(ControlError::MalformedPacket {
                reason: "rejected".to_string(),
            });
        }
        Ok(String::new())
    }

    async fn reconnect(&mut self) -> Result<(), ControlError> {
        Ok(())
    }
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
}

fn short_policy() -> snapkeep::RetentionPolicy {
    PruneConfig {
        keep_for: Duration::from_secs(2 * 3600),
        keep_hourly: 1,
        keep_daily: 0,
        keep_weekly: 0,
        keep_monthly: 0,
        keep_yearly: 0,
    }
    .to_policy()
    .unwrap()
}

#[tokio::test]
async fn test_tar_cycle_creates_and_prunes() {
    let source = tempdir().unwrap();
    std::fs::write(source.path().join("level.dat"), b"level").unwrap();
    let backups = tempdir().unwrap();

    let naming = SnapshotNaming::default();
    let mut config = TarConfig::new(source.path(), backups.path());
    config.compression = Compression::Gzip;
    let store = TarStore::open(config, naming.clone()).unwrap();

    for hour in 0..6 {
        store.create(&naming.generate(at(hour)).unwrap(), at(hour)).await.unwrap();
    }

    let control = RecordingControl::default();
    let mut cycle = BackupCycle::new(store, control.clone(), naming, short_policy(), CycleOptions::default());

    let report = cycle.run_once(at(10)).await.unwrap();

    assert_eq!(control.sent(), vec!["list", "save-off", "save-all", "save-on"]);
    let snapshot = report.snapshot.unwrap();
    assert_eq!(snapshot.name(), "mcb-2024-06-01-10:00");

    // Recent: the new snapshot. Hourly: 05:00. Everything older goes.
    let prune = report.prune.unwrap();
    assert_eq!(prune.kept, 2);
    assert_eq!(prune.removed, 5);

    let names: Vec<_> = cycle
        .store()
        .list()
        .await
        .unwrap()
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(names, vec!["mcb-2024-06-01-05:00", "mcb-2024-06-01-10:00"]);
}

#[tokio::test]
async fn test_failed_flush_leaves_store_untouched() {
    let store = Arc::new(MemoryStore::new());
    let control = RecordingControl {
        reject: Some("save-all"),
        ..RecordingControl::default()
    };
    let mut cycle = BackupCycle::new(
        Arc::clone(&store),
        control.clone(),
        SnapshotNaming::default(),
        short_policy(),
        CycleOptions::default(),
    );

    assert!(cycle.run_once(at(10)).await.is_err());

    assert_eq!(control.sent(), vec!["list", "save-off", "save-all", "save-on"]);
    assert!(store.is_empty());
    assert_eq!(store.created_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_cycles_until_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let control = RecordingControl::default();
    let cycle = BackupCycle::new(
        Arc::clone(&store),
        control.clone(),
        SnapshotNaming::default(),
        PruneConfig::default().to_policy().unwrap(),
        CycleOptions::default(),
    );

    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
    let scheduler = Scheduler::new("*/15 * * * *", cycle)
        .unwrap()
        .with_clock(MonotonicClock::new(start));

    // 00:15, 00:30 and 00:45 fall inside the 46 minutes before shutdown.
    let shutdown = tokio::time::sleep(Duration::from_secs(46 * 60));
    let completion = run_until_shutdown(scheduler, shutdown).await.unwrap();

    assert!(matches!(completion, Completion::Cancelled));
    assert_eq!(store.len(), 3);
    assert!(store.contains("mcb-2024-01-01-00:15"));
    assert!(store.contains("mcb-2024-01-01-00:45"));
    assert_eq!(control.sent().len(), 12);
}
