//! CLI for snapkeep.
//!
//! Takes snapshots of a running server on a cron schedule and thins old ones
//! with tiered retention. Every option can also be set from the environment.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use snapkeep::control::rcon::DEFAULT_PORT;
use snapkeep::error::ConfigError;
use snapkeep::naming::{DEFAULT_FORMAT, DEFAULT_PREFIX};
use snapkeep::prune::{format_bytes, plan};
use snapkeep::store::{Compression, TarConfig, ZfsConfig};
use snapkeep::{
    BackupCycle, Completion, CycleOptions, PruneConfig, RconClient, RconConfig, RetentionPolicy, Schedule, Scheduler,
    SnapshotNaming, SnapshotStore, TarStore, ZfsStore, run_until_shutdown,
};
use tracing_subscriber::EnvFilter;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// snapkeep: scheduled server snapshots with tiered retention.
#[derive(Parser)]
#[command(name = "snapkeep", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    options: Options,
}

/// Available CLI commands. Without one, a single cycle runs.
#[derive(Subcommand)]
enum Commands {
    /// Run a single backup cycle.
    Once,

    /// Run backup cycles on the cron schedule until SIGINT or SIGTERM.
    Cron,

    /// Apply retention to existing snapshots without taking a new one.
    Prune {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show snapshots with their classification and sizes.
    List {
        /// Print the listing as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the next fire times of the cron schedule.
    Schedule {
        /// Number of fire times to print.
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

/// Snapshot backend.
#[derive(Clone, Copy, ValueEnum)]
enum Provider {
    /// Compressed tar archives of a directory.
    Tar,
    /// Native ZFS snapshots of a dataset.
    Zfs,
}

#[derive(Args)]
struct Options {
    /// RCON host.
    #[arg(long, global = true, env = "RCON_HOST")]
    host: Option<String>,

    /// RCON port.
    #[arg(long, global = true, env = "RCON_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// RCON password.
    #[arg(long, global = true, env = "RCON_PASS", hide_env_values = true)]
    password: Option<String>,

    /// Timeout for each RCON connect and command (e.g. "10s").
    #[arg(long, global = true, env = "RCON_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    rcon_timeout: Duration,

    /// Snapshot backend.
    #[arg(long, global = true, env = "BACKUP_PROVIDER", value_enum, default_value = "tar")]
    provider: Provider,

    /// Log what would happen without creating or deleting snapshots.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Prefix of managed snapshot names.
    #[arg(long, global = true, env = "BACKUP_PREFIX", default_value = DEFAULT_PREFIX)]
    backup_prefix: String,

    /// strftime format of the timestamp in snapshot names.
    #[arg(long, global = true, env = "BACKUP_FORMAT", default_value = DEFAULT_FORMAT)]
    date_format: String,

    /// Log filter (e.g. "debug" or "snapkeep=trace"). Falls back to RUST_LOG.
    #[arg(long, global = true, env = "LOG_LEVEL")]
    level: Option<String>,

    /// Directory to archive (tar provider).
    #[arg(long, global = true, env = "SOURCE_DIRECTORY")]
    source_dir: Option<PathBuf>,

    /// Directory archives are written to (tar provider).
    #[arg(long, global = true, env = "BACKUP_DIRECTORY")]
    backup_dir: Option<PathBuf>,

    /// Archive compression: gzip, bzip2, lz4, xz or none.
    #[arg(long, global = true, env = "TAR_COMPRESSION")]
    tar_compression: Option<String>,

    /// Archive file extension (e.g. "tgz"). Defaults to the compression's own.
    #[arg(long, global = true, env = "TAR_EXTENSION")]
    tar_extension: Option<String>,

    /// Compression level (algorithm dependent, ignored for lz4).
    #[arg(long, global = true, env = "COMPRESSION_LEVEL")]
    compression_level: Option<u32>,

    /// Dataset to snapshot (zfs provider).
    #[arg(long, global = true, env = "ZFS_DATASET")]
    zfs_dataset: Option<String>,

    /// Snapshot descendant datasets too.
    #[arg(long, global = true, env = "ZFS_SNAPSHOT_RECURSE")]
    zfs_recursive: bool,

    /// Keep every snapshot younger than this (e.g. "24h").
    #[arg(long, global = true, env = "KEEP", value_parser = humantime::parse_duration)]
    keep: Option<Duration>,

    /// Hourly representatives to keep.
    #[arg(long, global = true, env = "KEEP_HOURLY")]
    keep_hourly: Option<u32>,

    /// Daily representatives to keep.
    #[arg(long, global = true, env = "KEEP_DAILY")]
    keep_daily: Option<u32>,

    /// Weekly representatives to keep.
    #[arg(long, global = true, env = "KEEP_WEEKLY")]
    keep_weekly: Option<u32>,

    /// Monthly representatives to keep.
    #[arg(long, global = true, env = "KEEP_MONTHLY")]
    keep_monthly: Option<u32>,

    /// Yearly representatives to keep.
    #[arg(long, global = true, env = "KEEP_YEARLY")]
    keep_yearly: Option<u32>,

    /// Cron expression for scheduled runs.
    #[arg(long, global = true, env = "CRON_SCHEDULE", default_value = "*/15 * * * *")]
    cron_schedule: String,

    /// Take scheduled snapshots without applying retention.
    #[arg(long, global = true, env = "CRON_NO_PRUNE")]
    no_prune: bool,
}

impl Options {
    fn naming(&self) -> CliResult<SnapshotNaming> {
        Ok(SnapshotNaming::new(&self.backup_prefix, &self.date_format)?)
    }

    fn policy(&self) -> CliResult<RetentionPolicy> {
        let defaults = PruneConfig::default();
        let config = PruneConfig {
            keep_for: self.keep.unwrap_or(defaults.keep_for),
            keep_hourly: self.keep_hourly.unwrap_or(defaults.keep_hourly),
            keep_daily: self.keep_daily.unwrap_or(defaults.keep_daily),
            keep_weekly: self.keep_weekly.unwrap_or(defaults.keep_weekly),
            keep_monthly: self.keep_monthly.unwrap_or(defaults.keep_monthly),
            keep_yearly: self.keep_yearly.unwrap_or(defaults.keep_yearly),
        };
        Ok(config.to_policy()?)
    }

    /// `--no-prune` only applies to cron firings.
    fn cycle_options(&self, scheduled: bool) -> CycleOptions {
        CycleOptions {
            dry_run: self.dry_run,
            no_prune: scheduled && self.no_prune,
        }
    }

    fn rcon(&self) -> CliResult<RconConfig> {
        let host = self.host.as_deref().ok_or(ConfigError::MissingOption("--host"))?;
        let password = self.password.as_deref().ok_or(ConfigError::MissingOption("--password"))?;
        let mut config = RconConfig::new(host, password);
        config.port = self.port;
        config.timeout = self.rcon_timeout;
        Ok(config)
    }

    /// Opens the configured backend and checks it is usable.
    async fn store(&self, naming: &SnapshotNaming) -> CliResult<Box<dyn SnapshotStore>> {
        match self.provider {
            Provider::Tar => {
                let source = self.source_dir.clone().ok_or(ConfigError::MissingOption("--source-dir"))?;
                let backups = self.backup_dir.clone().ok_or(ConfigError::MissingOption("--backup-dir"))?;
                let mut config = TarConfig::new(source, backups);
                if let Some(algorithm) = &self.tar_compression {
                    config.compression = algorithm.parse::<Compression>()?;
                }
                config.level = self.compression_level;
                config.extension.clone_from(&self.tar_extension);
                Ok(Box::new(TarStore::open(config, naming.clone())?))
            }
            Provider::Zfs => {
                let dataset = self.zfs_dataset.clone().ok_or(ConfigError::MissingOption("--zfs-dataset"))?;
                let mut config = ZfsConfig::new(dataset);
                config.recursive = self.zfs_recursive;
                let store = ZfsStore::new(config, naming.clone())?;
                store.check().await?;
                Ok(Box::new(store))
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.options.level.as_deref());

    let options = &cli.options;
    let result = match cli.command.unwrap_or(Commands::Once) {
        Commands::Once => cmd_once(options).await,
        Commands::Cron => cmd_cron(options).await,
        Commands::Prune { json } => cmd_prune(options, json).await,
        Commands::List { json } => cmd_list(options, json).await,
        Commands::Schedule { count } => cmd_schedule(options, count),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "snapkeep failed");
        std::process::exit(1);
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Builds the cycle, connecting to both the store and the server.
async fn backup_cycle(
    options: &Options,
    scheduled: bool,
) -> CliResult<BackupCycle<Box<dyn SnapshotStore>, RconClient>> {
    let naming = options.naming()?;
    let policy = options.policy()?;
    let store = options.store(&naming).await?;
    let control = RconClient::connect(options.rcon()?).await?;
    Ok(BackupCycle::new(store, control, naming, policy, options.cycle_options(scheduled)))
}

/// Implements `snapkeep once`.
async fn cmd_once(options: &Options) -> CliResult {
    let mut cycle = backup_cycle(options, false).await?;
    let report = cycle.run_once(Utc::now()).await?;

    if let Some(prune) = report.prune
        && prune.failed > 0
    {
        tracing::warn!(count = prune.failed, "some snapshots could not be deleted");
    }
    Ok(())
}

/// Implements `snapkeep cron`.
async fn cmd_cron(options: &Options) -> CliResult {
    let schedule = Schedule::parse(&options.cron_schedule)?;
    let cycle = backup_cycle(options, true).await?;
    let shutdown = shutdown_signal()?;

    if let Some(next) = schedule.upcoming(Utc::now(), 1).first() {
        tracing::info!(schedule = %schedule, next = %next, "starting scheduled backups");
    }
    let scheduler = Scheduler::from_schedule(schedule, cycle);

    match run_until_shutdown(scheduler, shutdown).await? {
        Completion::Cancelled => {}
        Completion::Completed(error) => {
            if let Some(e) = error {
                tracing::warn!(error = %e, "last backup before shutdown failed");
            }
        }
        Completion::Exhausted => tracing::warn!("cron schedule has no further occurrences"),
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// Implements `snapkeep prune`.
async fn cmd_prune(options: &Options, json: bool) -> CliResult {
    let naming = options.naming()?;
    let policy = options.policy()?;
    let store = options.store(&naming).await?;

    let report = snapkeep::prune(&store, &policy, options.dry_run).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

/// Implements `snapkeep list`.
async fn cmd_list(options: &Options, json: bool) -> CliResult {
    let naming = options.naming()?;
    let policy = options.policy()?;
    let store = options.store(&naming).await?;

    let classification = plan(&store, &policy).await?;
    let rows = classification
        .keep
        .iter()
        .map(|s| ("keep", s))
        .chain(classification.remove.iter().map(|s| ("remove", s)));

    let mut entries = Vec::with_capacity(classification.len());
    for (action, snapshot) in rows {
        let usage = store.usage(snapshot).await.unwrap_or_else(|e| {
            tracing::warn!(snapshot = snapshot.name(), error = %e, "failed to read snapshot size");
            snapkeep::SnapshotUsage::default()
        });
        entries.push((action, snapshot, usage));
    }
    entries.sort_by(|a, b| a.1.cmp(b.1));

    if json {
        let values: Vec<_> = entries
            .iter()
            .map(|(action, snapshot, usage)| {
                serde_json::json!({
                    "name": snapshot.name(),
                    "created_at": snapshot.created_at().to_rfc3339(),
                    "action": action,
                    "reason": snapshot.reason().to_string(),
                    "space_used": usage.space_used,
                    "logical_size": usage.logical_size,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    println!("{:<32} {:<7} {:<28} {:>10} {:>10}", "NAME", "ACTION", "REASON", "USED", "SIZE");
    for (action, snapshot, usage) in &entries {
        println!(
            "{:<32} {:<7} {:<28} {:>10} {:>10}",
            snapshot.name(),
            action,
            snapshot.reason().to_string(),
            format_bytes(usage.space_used),
            format_bytes(usage.logical_size),
        );
    }
    println!();
    println!(
        "{} snapshots: {} kept, {} to remove",
        classification.len(),
        classification.keep.len(),
        classification.remove.len()
    );
    Ok(())
}

/// Implements `snapkeep schedule`.
fn cmd_schedule(options: &Options, count: usize) -> CliResult {
    let schedule = Schedule::parse(&options.cron_schedule)?;
    let now = Utc::now();

    println!("Schedule: {schedule}");
    for next in schedule.upcoming(now, count) {
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        let wait = Duration::from_secs(wait.as_secs());
        println!("  {}  (in {})", next.to_rfc3339(), humantime::format_duration(wait));
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
///
/// Handlers are installed before returning so a signal that arrives during
/// startup is not lost.
#[cfg(unix)]
fn shutdown_signal() -> CliResult<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    })
}

/// Resolves on Ctrl+C.
#[cfg(not(unix))]
fn shutdown_signal() -> CliResult<impl Future<Output = ()>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received Ctrl+C"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
        }
    })
}
