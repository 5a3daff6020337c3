//! Tar archive backend.
//!
//! Each snapshot is one archive of the source directory in the backup
//! directory, named `<snapshot name>.<extension>`. Archives are written to a
//! `.partial` file first and renamed into place once complete, so a crash
//! mid-write never leaves a truncated file under a managed name.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use lz4_flex::frame::FrameEncoder;
use serde::{Deserialize, Serialize};
use xz2::write::XzEncoder;

use super::SnapshotStore;
use crate::error::{ConfigError, StoreError};
use crate::naming::SnapshotNaming;
use crate::snapshot::{Snapshot, SnapshotUsage};

const PARTIAL_SUFFIX: &str = ".partial";
/// Preset `xz` itself uses when no level is given.
const DEFAULT_XZ_LEVEL: u32 = 6;

/// Archive compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// gzip via flate2, levels 0-9.
    #[default]
    Gzip,
    /// bzip2, levels 1-9.
    Bzip2,
    /// LZ4 frame format. Has no levels.
    Lz4,
    /// xz (LZMA2), levels 0-9.
    Xz,
    /// Plain tar.
    None,
}

impl Compression {
    /// Algorithm name as accepted by [`FromStr`].
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Lz4 => "lz4",
            Self::Xz => "xz",
            Self::None => "none",
        }
    }

    /// Default file extension for archives, without the leading dot.
    pub fn extension(self) -> &'static str {
        self.extensions()[0]
    }

    /// Every extension an archive of this kind may use, default first.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Gzip => &["tar.gz", "tgz"],
            Self::Bzip2 => &["tar.bz2", "tbz2"],
            Self::Lz4 => &["tar.lz4", "tlz4"],
            Self::Xz => &["tar.xz", "txz"],
            Self::None => &["tar"],
        }
    }

    /// Accepted level range, or `None` if the algorithm has no levels.
    pub fn levels(self) -> Option<(u32, u32)> {
        match self {
            Self::Gzip | Self::Xz => Some((0, 9)),
            Self::Bzip2 => Some((1, 9)),
            Self::Lz4 | Self::None => None,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(Self::Gzip),
            "bzip2" | "bz2" => Ok(Self::Bzip2),
            "lz4" => Ok(Self::Lz4),
            "xz" => Ok(Self::Xz),
            "none" | "tar" => Ok(Self::None),
            _ => Err(ConfigError::UnknownCompression {
                algorithm: s.to_string(),
            }),
        }
    }
}

/// Configuration for [`TarStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarConfig {
    /// Directory to archive.
    pub source_dir: PathBuf,
    /// Directory archives are written to.
    pub backup_dir: PathBuf,
    /// Archive compression.
    #[serde(default)]
    pub compression: Compression,
    /// Compression level. Defaults to the encoder's default.
    #[serde(default)]
    pub level: Option<u32>,
    /// Archive file extension, without the leading dot. Defaults to the
    /// compression's own extension.
    #[serde(default)]
    pub extension: Option<String>,
}

impl TarConfig {
    /// Creates a gzip configuration with the default level.
    pub fn new(source_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            backup_dir: backup_dir.into(),
            compression: Compression::default(),
            level: None,
            extension: None,
        }
    }

    /// The extension archives are written and listed with.
    pub fn extension(&self) -> &str {
        self.extension
            .as_deref()
            .unwrap_or_else(|| self.compression.extension())
    }

    /// Validates the compression settings.
    ///
    /// A level given for an algorithm without levels is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCompressionLevel`] if the level is out
    /// of the algorithm's range, or [`ConfigError::ExtensionMismatch`] if the
    /// extension is not one the algorithm's archives use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(level) = self.level
            && let Some((min, max)) = self.compression.levels()
            && !(min..=max).contains(&level)
        {
            return Err(ConfigError::InvalidCompressionLevel {
                algorithm: self.compression.as_str(),
                level,
                min,
                max,
            });
        }

        let extension = self.extension();
        if !self.compression.extensions().contains(&extension) {
            return Err(ConfigError::ExtensionMismatch {
                extension: extension.to_string(),
                algorithm: self.compression.as_str(),
                expected: self.compression.extensions().join(", "),
            });
        }
        Ok(())
    }
}

/// Snapshots stored as tar archives on a local filesystem.
#[derive(Debug, Clone)]
pub struct TarStore {
    config: TarConfig,
    naming: SnapshotNaming,
}

impl TarStore {
    /// Opens the store, creating the backup directory if it is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid, the source
    /// directory does not exist, or either directory is not a writable
    /// directory.
    pub fn open(config: TarConfig, naming: SnapshotNaming) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.level.is_some() && config.compression.levels().is_none() {
            tracing::warn!(compression = %config.compression, "compression has no levels, ignoring level");
        }
        check_directory(&config.backup_dir, "backup", true)?;
        check_directory(&config.source_dir, "source", false)?;
        Ok(Self { config, naming })
    }

    /// The store's configuration.
    pub fn config(&self) -> &TarConfig {
        &self.config
    }

    /// Where the archive for `name` lives.
    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.config
            .backup_dir
            .join(format!("{name}.{}", self.config.extension()))
    }
}

fn check_directory(path: &Path, kind: &'static str, create: bool) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidDirectory {
        kind,
        path: path.to_path_buf(),
        reason,
    };

    if create && !path.exists() {
        tracing::info!(dir = %path.display(), "creating {kind} directory");
        std::fs::create_dir_all(path).map_err(|e| invalid(e.to_string()))?;
    }

    let meta = std::fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
    if !meta.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    if create && meta.permissions().readonly() {
        return Err(invalid("not writable".to_string()));
    }
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Archives `source` under its own directory name.
fn append_source<W: Write>(writer: W, source: &Path) -> io::Result<W> {
    let root = source.file_name().map_or_else(|| PathBuf::from("."), PathBuf::from);
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    builder.append_dir_all(root, source)?;
    builder.into_inner()
}

fn write_archive(config: &TarConfig, partial: &Path) -> io::Result<()> {
    let file = File::create(partial)?;
    let source = &config.source_dir;
    let file = match config.compression {
        Compression::Gzip => {
            let level = config
                .level
                .map_or_else(flate2::Compression::default, flate2::Compression::new);
            append_source(GzEncoder::new(file, level), source)?.finish()?
        }
        Compression::Bzip2 => {
            let level = config
                .level
                .map_or_else(bzip2::Compression::default, bzip2::Compression::new);
            append_source(BzEncoder::new(file, level), source)?.finish()?
        }
        Compression::Lz4 => append_source(FrameEncoder::new(file), source)?
            .finish()
            .map_err(io::Error::other)?,
        Compression::Xz => {
            let level = config.level.unwrap_or(DEFAULT_XZ_LEVEL);
            append_source(XzEncoder::new(file, level), source)?.finish()?
        }
        Compression::None => append_source(file, source)?,
    };
    file.sync_all()
}

#[async_trait]
impl SnapshotStore for TarStore {
    fn kind(&self) -> &'static str {
        "tar"
    }

    #[tracing::instrument(name = "tar", skip(self, when), fields(source = %self.config.source_dir.display()))]
    async fn create(&self, name: &str, when: DateTime<Utc>) -> Result<Snapshot, StoreError> {
        let path = self.archive_path(name);
        if tokio::fs::try_exists(&path).await.map_err(io_error(&path))? {
            return Err(StoreError::AlreadyExists {
                name: name.to_string(),
            });
        }

        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        tracing::debug!(path = %path.display(), "writing archive");
        let config = self.config.clone();
        let staging = partial.clone();
        let written = tokio::task::spawn_blocking(move || write_archive(&config, &staging))
            .await
            .map_err(|e| StoreError::Task {
                reason: e.to_string(),
            })?;

        if let Err(source) = written {
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                tracing::warn!(path = %partial.display(), error = %e, "failed to remove partial archive");
            }
            return Err(StoreError::Io {
                path: partial,
                source,
            });
        }

        tokio::fs::rename(&partial, &path)
            .await
            .map_err(io_error(&path))?;
        tracing::info!(path = %path.display(), "archive created");

        Ok(Snapshot::new(name, when))
    }

    async fn list(&self) -> Result<Vec<Snapshot>, StoreError> {
        let dir = &self.config.backup_dir;
        let suffix = format!(".{}", self.config.extension());
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error(dir))?;

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(dir))? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !self.naming.is_managed(file_name) {
                continue;
            }
            let Some(name) = file_name.strip_suffix(&suffix) else {
                tracing::debug!(file = file_name, "skipping file without archive extension");
                continue;
            };
            match self.naming.parse(name) {
                Ok(when) => snapshots.push(Snapshot::new(name, when)),
                Err(e) => tracing::warn!(file = file_name, error = %e, "skipping unparseable archive"),
            }
        }

        snapshots.sort();
        Ok(snapshots)
    }

    async fn delete(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let path = self.archive_path(snapshot.name());
        tracing::debug!(path = %path.display(), "removing archive");
        tokio::fs::remove_file(&path).await.map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound {
                    name: snapshot.name().to_string(),
                }
            } else {
                StoreError::Io { path, source }
            }
        })
    }

    async fn usage(&self, snapshot: &Snapshot) -> Result<SnapshotUsage, StoreError> {
        let path = self.archive_path(snapshot.name());
        let meta = tokio::fs::metadata(&path).await.map_err(io_error(&path))?;

        #[cfg(unix)]
        let space_used = {
            use std::os::unix::fs::MetadataExt;
            meta.blocks() * 512
        };
        #[cfg(not(unix))]
        let space_used = meta.len();

        Ok(SnapshotUsage {
            space_used,
            logical_size: meta.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_from_str() {
        let cases = [
            ("gzip", Compression::Gzip),
            ("GZ", Compression::Gzip),
            ("bzip2", Compression::Bzip2),
            ("bz2", Compression::Bzip2),
            ("lz4", Compression::Lz4),
            ("xz", Compression::Xz),
            ("none", Compression::None),
        ];
        for (name, expected) in cases {
            assert_eq!(name.parse::<Compression>().unwrap(), expected, "{name}");
        }
        assert!(matches!(
            "zstd".parse::<Compression>(),
            Err(ConfigError::UnknownCompression { .. })
        ));
    }

    #[test]
    fn test_extension() {
        assert_eq!(Compression::Gzip.extension(), "tar.gz");
        assert_eq!(Compression::Bzip2.extension(), "tar.bz2");
        assert_eq!(Compression::Lz4.extension(), "tar.lz4");
        assert_eq!(Compression::Xz.extension(), "tar.xz");
        assert_eq!(Compression::None.extension(), "tar");
    }

    #[test]
    fn test_extension_override() {
        let mut config = TarConfig::new("/src", "/dst");
        config.compression = Compression::Xz;
        assert_eq!(config.extension(), "tar.xz");

        config.extension = Some("txz".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.extension(), "txz");

        config.extension = Some("tar.gz".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ExtensionMismatch { algorithm: "xz", .. })
        ));
    }

    #[test]
    fn test_level_validation() {
        let mut config = TarConfig::new("/src", "/dst");
        assert!(config.validate().is_ok());
        config.level = Some(9);
        assert!(config.validate().is_ok());
        config.level = Some(10);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCompressionLevel { level: 10, .. })
        ));

        config.compression = Compression::Bzip2;
        config.level = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCompressionLevel { algorithm: "bzip2", min: 1, .. })
        ));

        // LZ4 frames have no levels to check.
        config.compression = Compression::Lz4;
        config.level = Some(42);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_open_requires_source() {
        let dir = tempfile::tempdir().unwrap();
        let config = TarConfig::new(dir.path().join("missing"), dir.path().join("backups"));

        let result = TarStore::open(config, SnapshotNaming::default());
        assert!(matches!(
            result,
            Err(ConfigError::InvalidDirectory { kind: "source", .. })
        ));
        // The backup directory is created before the source is checked.
        assert!(dir.path().join("backups").is_dir());
    }

    #[test]
    fn test_open_rejects_file_as_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        let result = TarStore::open(TarConfig::new(dir.path(), &file), SnapshotNaming::default());
        assert!(matches!(
            result,
            Err(ConfigError::InvalidDirectory { kind: "backup", .. })
        ));
    }
}
