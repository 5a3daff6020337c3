//! Error types for snapkeep.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for all snapkeep operations.
///
/// Each variant but [`Resume`](Self::Resume) wraps the error of one concern.
/// Classification has no variant because it cannot fail.
#[derive(Error, Debug)]
pub enum SnapkeepError {
    /// Invalid configuration, fatal at startup.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Schedule parsing or scheduler task failure.
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Control channel to the managed server failed.
    #[error("control error: {0}")]
    Control(#[from] ControlError),

    /// Snapshot store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Snapshot naming failure.
    #[error("naming error: {0}")]
    Naming(#[from] NamingError),

    /// A cycle step failed and re-enabling saving failed after it.
    #[error("{cause}; re-enabling saving also failed: {resume}")]
    Resume {
        /// The first failure of the cycle.
        #[source]
        cause: Box<SnapkeepError>,
        /// Why `save-on` failed.
        resume: Box<SnapkeepError>,
    },
}

/// Errors raised while validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Tiers must be listed from finest to coarsest granularity.
    #[error("tiers must be ordered from finest to coarsest granularity ({previous} before {next})")]
    TiersNotOrdered {
        /// Label of the earlier tier.
        previous: String,
        /// Label of the offending later tier.
        next: String,
    },

    /// The recent window cannot be represented as a calendar duration.
    #[error("keep duration {duration:?} is out of range")]
    KeepForOutOfRange {
        /// The rejected duration.
        duration: Duration,
    },

    /// The date format cannot be parsed back into a timestamp.
    #[error("date format '{format}' cannot be used for snapshot names: {reason}")]
    InvalidNameFormat {
        /// The rejected strftime format.
        format: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A required option was not supplied.
    #[error("missing required option: {0}")]
    MissingOption(&'static str),

    /// A directory required by a store is unusable.
    #[error("{kind} directory '{}' is unusable: {reason}", path.display())]
    InvalidDirectory {
        /// What the directory is for ("source", "backup").
        kind: &'static str,
        /// The directory path.
        path: PathBuf,
        /// Why it is unusable.
        reason: String,
    },

    /// The ZFS dataset name is unusable.
    #[error("invalid zfs dataset '{dataset}': {reason}")]
    InvalidDataset {
        /// The rejected dataset name.
        dataset: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The archive compression algorithm is not supported.
    #[error("unknown compression algorithm '{algorithm}' (expected gzip, bzip2, lz4, xz or none)")]
    UnknownCompression {
        /// The rejected algorithm name.
        algorithm: String,
    },

    /// Compression level outside the range the encoder accepts.
    #[error("invalid {algorithm} compression level {level} (must be {min}-{max})")]
    InvalidCompressionLevel {
        /// The configured algorithm.
        algorithm: &'static str,
        /// The rejected level.
        level: u32,
        /// Lowest accepted level.
        min: u32,
        /// Highest accepted level.
        max: u32,
    },

    /// The archive extension does not match the compression algorithm.
    #[error("extension '{extension}' does not match {algorithm} compression (expected one of {expected})")]
    ExtensionMismatch {
        /// The rejected extension.
        extension: String,
        /// The configured algorithm.
        algorithm: &'static str,
        /// Extensions accepted for the algorithm.
        expected: String,
    },
}

/// Errors raised by the cron schedule and the scheduler task.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// The cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression {
        /// The rejected expression.
        expression: String,
        /// The parser's explanation.
        reason: String,
    },

    /// No further occurrence could be computed.
    #[error("cron expression '{expression}' has no occurrence after {after}")]
    NoNextOccurrence {
        /// The expression.
        expression: String,
        /// The time searched from.
        after: chrono::DateTime<chrono::Utc>,
    },

    /// The scheduler task itself failed (outside the job boundary).
    #[error("scheduler task failed: {reason}")]
    TaskFailed {
        /// Description of the task failure.
        reason: String,
    },
}

/// Errors raised by the remote control client.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Could not open a connection.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The address dialled.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The server rejected the password.
    #[error("authentication rejected by {addr}")]
    AuthFailed {
        /// The server address.
        addr: String,
    },

    /// The connection broke mid-exchange.
    #[error("control connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The server did not answer in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// A packet could not be decoded.
    #[error("malformed packet: {reason}")]
    MalformedPacket {
        /// What was wrong with it.
        reason: String,
    },

    /// The command body exceeds the protocol limit.
    #[error("command is {len} bytes, limit is {max}")]
    CommandTooLong {
        /// The command length.
        len: usize,
        /// The protocol limit.
        max: usize,
    },

    /// The client has no live connection.
    #[error("not connected")]
    NotConnected,
}

/// Errors raised by snapshot stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("failed to access '{}': {source}", path.display())]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An external command exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Captured standard error.
        stderr: String,
    },

    /// An external command could not be spawned.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        /// The command line that was run.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Output from the backend could not be understood.
    #[error("unexpected backend output: {reason}")]
    Parse {
        /// Description of the problem.
        reason: String,
    },

    /// The snapshot does not exist in this store.
    #[error("snapshot '{name}' not found")]
    NotFound {
        /// The snapshot name.
        name: String,
    },

    /// A snapshot with this name already exists.
    #[error("snapshot '{name}' already exists")]
    AlreadyExists {
        /// The snapshot name.
        name: String,
    },

    /// A blocking worker panicked or was cancelled.
    #[error("background task failed: {reason}")]
    Task {
        /// Description of the failure.
        reason: String,
    },

    /// Name generation failed while creating a snapshot.
    #[error(transparent)]
    Naming(#[from] NamingError),
}

/// Errors raised while generating or parsing snapshot names.
#[derive(Error, Debug)]
pub enum NamingError {
    /// The name does not carry the managed prefix.
    #[error("'{name}' does not start with prefix '{prefix}'")]
    MissingPrefix {
        /// The name examined.
        name: String,
        /// The expected prefix.
        prefix: String,
    },

    /// The remainder of the name does not match the date format.
    #[error("'{name}' does not match format '{format}': {source}")]
    Unparseable {
        /// The name examined.
        name: String,
        /// The strftime format.
        format: String,
        /// The chrono parse error.
        #[source]
        source: chrono::ParseError,
    },

    /// The timestamp could not be rendered with the format.
    #[error("failed to format timestamp with '{format}'")]
    Format {
        /// The strftime format.
        format: String,
    },
}

/// Type alias for `Result<T, SnapkeepError>`.
pub type Result<T> = std::result::Result<T, SnapkeepError>;
