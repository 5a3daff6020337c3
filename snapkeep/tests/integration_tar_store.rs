//! Integration tests for the tar archive store.
//!
//! Each test builds a small source tree in a temporary directory, archives
//! it and checks the archive contents and listing behavior.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{TimeZone, Utc};
use flate2::read::GzDecoder;
use snapkeep::error::StoreError;
use snapkeep::store::{Compression, SnapshotStore, TarConfig, TarStore};
use snapkeep::{PruneConfig, SnapshotNaming, prune};
use tempfile::{TempDir, tempdir};

/// Creates `world/level.dat` and `world/region/r.0.0.mca` under a temp dir.
fn source_tree() -> TempDir {
    let dir = tempdir().unwrap();
    let world = dir.path().join("world");
    std::fs::create_dir_all(world.join("region")).unwrap();
    std::fs::write(world.join("level.dat"), b"level data").unwrap();
    std::fs::write(world.join("region").join("r.0.0.mca"), vec![7u8; 4096]).unwrap();
    dir
}

fn open_store(source: &Path, backups: &Path, compression: Compression) -> TarStore {
    let mut config = TarConfig::new(source, backups);
    config.compression = compression;
    TarStore::open(config, SnapshotNaming::default()).unwrap()
}

fn entry_names<R: Read>(reader: R) -> Vec<String> {
    let mut archive = tar::Archive::new(reader);
    let mut names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn decoder(compression: Compression, file: File) -> Box<dyn Read> {
    match compression {
        Compression::Gzip => Box::new(GzDecoder::new(file)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        Compression::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(file)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(file)),
        Compression::None => Box::new(file),
    }
}

#[tokio::test]
async fn test_create_list_delete_round_trip() {
    let source = source_tree();
    let backups = tempdir().unwrap();
    let store = open_store(&source.path().join("world"), backups.path(), Compression::Gzip);

    let when = Utc.with_ymd_and_hms(2024, 2, 10, 8, 30, 0).unwrap();
    let created = store.create("mcb-2024-02-10-08:30", when).await.unwrap();
    assert_eq!(created.created_at(), when);

    let archive = backups.path().join("mcb-2024-02-10-08:30.tar.gz");
    assert!(archive.is_file());
    let names = entry_names(GzDecoder::new(File::open(&archive).unwrap()));
    assert!(names.iter().any(|n| n == "world/level.dat"));
    assert!(names.iter().any(|n| n == "world/region/r.0.0.mca"));

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name(), "mcb-2024-02-10-08:30");
    assert_eq!(listed[0].created_at(), when);

    let usage = store.usage(&listed[0]).await.unwrap();
    assert!(usage.logical_size > 0);

    store.delete(&listed[0]).await.unwrap();
    assert!(!archive.exists());
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_uncompressed_archive() {
    let source = source_tree();
    let backups = tempdir().unwrap();
    let store = open_store(&source.path().join("world"), backups.path(), Compression::None);

    let when = Utc.with_ymd_and_hms(2024, 2, 10, 9, 0, 0).unwrap();
    store.create("mcb-2024-02-10-09:00", when).await.unwrap();

    let archive = backups.path().join("mcb-2024-02-10-09:00.tar");
    let names = entry_names(File::open(&archive).unwrap());
    assert!(names.iter().any(|n| n == "world/level.dat"));
}

#[tokio::test]
async fn test_every_compression_round_trips() {
    let cases = [
        (Compression::Gzip, "tar.gz"),
        (Compression::Bzip2, "tar.bz2"),
        (Compression::Lz4, "tar.lz4"),
        (Compression::Xz, "tar.xz"),
    ];

    let source = source_tree();
    for (compression, extension) in cases {
        let backups = tempdir().unwrap();
        let store = open_store(&source.path().join("world"), backups.path(), compression);

        let when = Utc.with_ymd_and_hms(2024, 2, 11, 8, 0, 0).unwrap();
        store.create("mcb-2024-02-11-08:00", when).await.unwrap();

        let archive = backups.path().join(format!("mcb-2024-02-11-08:00.{extension}"));
        let names = entry_names(decoder(compression, File::open(&archive).unwrap()));
        assert!(names.iter().any(|n| n == "world/level.dat"), "{compression}");
        assert!(names.iter().any(|n| n == "world/region/r.0.0.mca"), "{compression}");

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1, "{compression}");
        assert_eq!(listed[0].name(), "mcb-2024-02-11-08:00");
    }
}

#[tokio::test]
async fn test_compression_level_is_applied() {
    let source = tempdir().unwrap();
    std::fs::write(source.path().join("zeros.bin"), vec![0u8; 256 * 1024]).unwrap();

    let mut sizes = Vec::new();
    for level in [0, 9] {
        let backups = tempdir().unwrap();
        let mut config = TarConfig::new(source.path(), backups.path());
        config.level = Some(level);
        let store = TarStore::open(config, SnapshotNaming::default()).unwrap();

        let when = Utc.with_ymd_and_hms(2024, 2, 12, 0, 0, 0).unwrap();
        let snapshot = store.create("mcb-2024-02-12-00:00", when).await.unwrap();
        sizes.push(store.usage(&snapshot).await.unwrap().logical_size);
    }

    // gzip level 0 stores the data as is.
    assert!(sizes[0] > 256 * 1024);
    assert!(sizes[1] < sizes[0] / 10);
}

#[tokio::test]
async fn test_extension_override() {
    let source = source_tree();
    let backups = tempdir().unwrap();
    let mut config = TarConfig::new(source.path().join("world"), backups.path());
    config.extension = Some("tgz".to_string());
    let store = TarStore::open(config, SnapshotNaming::default()).unwrap();

    let when = Utc.with_ymd_and_hms(2024, 2, 13, 0, 0, 0).unwrap();
    store.create("mcb-2024-02-13-00:00", when).await.unwrap();
    std::fs::write(backups.path().join("mcb-2024-02-12-00:00.tar.gz"), b"").unwrap();

    let archive = backups.path().join("mcb-2024-02-13-00:00.tgz");
    let names = entry_names(GzDecoder::new(File::open(&archive).unwrap()));
    assert!(names.iter().any(|n| n == "world/level.dat"));

    // Only archives with the configured extension are managed.
    let listed = store.list().await.unwrap();
    let names: Vec<_> = listed.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["mcb-2024-02-13-00:00"]);
}

#[tokio::test]
async fn test_list_skips_foreign_and_partial_files() {
    let source = source_tree();
    let backups = tempdir().unwrap();
    let store = open_store(&source.path().join("world"), backups.path(), Compression::Gzip);

    for name in [
        "notes.txt",
        "mcb-2024-01-01-00:00.tar.gz.partial",
        "mcb-garbage.tar.gz",
        "mcb-2024-01-01-00:00.tar",
        "mcb-2024-01-02-00:00.tar.gz",
        "mcb-2024-01-01-06:00.tar.gz",
    ] {
        std::fs::write(backups.path().join(name), b"").unwrap();
    }

    let listed = store.list().await.unwrap();
    let names: Vec<_> = listed.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["mcb-2024-01-01-06:00", "mcb-2024-01-02-00:00"]);
}

#[tokio::test]
async fn test_create_refuses_existing_name() {
    let source = source_tree();
    let backups = tempdir().unwrap();
    let store = open_store(&source.path().join("world"), backups.path(), Compression::Gzip);

    let when = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    store.create("mcb-2024-03-01-00:00", when).await.unwrap();

    let result = store.create("mcb-2024-03-01-00:00", when).await;
    assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
}

#[tokio::test]
async fn test_delete_missing_archive() {
    let source = source_tree();
    let backups = tempdir().unwrap();
    let store = open_store(&source.path().join("world"), backups.path(), Compression::Gzip);

    let ghost = snapkeep::Snapshot::new("mcb-2024-03-01-00:00", Utc::now());
    assert!(matches!(store.delete(&ghost).await, Err(StoreError::NotFound { .. })));
}

#[tokio::test]
async fn test_prune_removes_old_archives() {
    let source = source_tree();
    let backups = tempdir().unwrap();
    let store = open_store(&source.path().join("world"), backups.path(), Compression::Gzip);
    let naming = SnapshotNaming::default();

    // Six archives an hour apart.
    for hour in 0..6 {
        let when = Utc.with_ymd_and_hms(2024, 4, 1, hour, 0, 0).unwrap();
        store.create(&naming.generate(when).unwrap(), when).await.unwrap();
    }

    let policy = PruneConfig {
        keep_for: std::time::Duration::from_secs(2 * 3600),
        keep_hourly: 1,
        keep_daily: 0,
        keep_weekly: 0,
        keep_monthly: 0,
        keep_yearly: 0,
    }
    .to_policy()
    .unwrap();

    let report = prune(&store, &policy, false).await.unwrap();

    // Recent: 04:00 and 05:00. Hourly: 03:00.
    assert_eq!(report.kept, 3);
    assert_eq!(report.removed, 3);
    assert!(report.space_kept > 0);

    let names: Vec<_> = store.list().await.unwrap().iter().map(|s| s.name().to_string()).collect();
    assert_eq!(
        names,
        vec!["mcb-2024-04-01-03:00", "mcb-2024-04-01-04:00", "mcb-2024-04-01-05:00"]
    );
}
