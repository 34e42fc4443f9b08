use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use segbackup::config::DEFAULT_TOOL_NAME;
use segbackup::context::new_timestamp;
use segbackup::{
    Backup, ClusterConfig, ClusterExecutor, CommandUnloader, Config, ConnectionConfig,
    ObjectFilter, PluginConfig, PsqlSession, RunContext, SnapshotCatalog, Transport,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Local,
    Ssh,
}

impl From<TransportArg> for Transport {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Local => Transport::Local,
            TransportArg::Ssh => Transport::Ssh,
        }
    }
}

/// Back up a segmented database cluster through per-segment named pipes.
#[derive(Debug, Parser)]
#[command(name = "segbackup", version)]
struct Command {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Root directory for backup files on every host
    #[arg(long)]
    backup_dir: Option<PathBuf>,
    /// Cluster topology (JSON)
    #[arg(long, default_value = "cluster.json")]
    cluster_config: PathBuf,
    /// Catalog snapshot (JSON)
    #[arg(long, default_value = "catalog.json")]
    catalog: PathBuf,
    /// Back up only this relation (schema.name), repeatable
    #[arg(long)]
    include_table: Vec<String>,
    /// Skip this relation (schema.name), repeatable
    #[arg(long)]
    exclude_table: Vec<String>,
    /// Capture leaf partitions individually
    #[arg(long)]
    leaf_partition_data: bool,
    /// gzip level, 0 disables compression
    #[arg(long, default_value = "1")]
    compression_level: u32,
    /// Compression filter to use instead of gzip
    #[arg(long)]
    compression_program: Option<String>,
    /// Storage plugin configuration (YAML)
    #[arg(long)]
    plugin_config: Option<PathBuf>,
    /// Command run on each segment to write its data into {pipe}
    #[arg(long)]
    unload_command: String,
    /// Run timestamp (YYYYMMDDHHMMSS), defaults to now
    #[arg(long)]
    timestamp: Option<String>,
    #[arg(long, value_enum, default_value = "ssh")]
    transport: TransportArg,
    #[arg(long, default_value = "postgres")]
    dbname: String,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    user: Option<String>,
    /// Fail if segment readers are still draining after this many seconds
    /// (default: wait until they exit)
    #[arg(long)]
    reader_timeout_secs: Option<u64>,
}

/// How long an interrupted run gets to return from its current step.
const WORKER_EXIT_GRACE: Duration = Duration::from_secs(10);

impl From<Command> for Config {
    fn from(opts: Command) -> Self {
        Config {
            verbosity: opts.verbose,
            backup_dir: opts.backup_dir,
            cluster_config: opts.cluster_config,
            catalog: opts.catalog,
            include_tables: opts.include_table,
            exclude_tables: opts.exclude_table,
            leaf_partition_data: opts.leaf_partition_data,
            compression_level: opts.compression_level,
            compression_program: opts.compression_program,
            plugin_config: opts.plugin_config,
            unload_command: opts.unload_command,
            timestamp: opts.timestamp,
            transport: opts.transport.into(),
            connection: ConnectionConfig {
                dbname: opts.dbname,
                host: opts.host,
                port: opts.port,
                user: opts.user,
            },
            reader_timeout_secs: opts.reader_timeout_secs,
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();
}

fn build_backup(config: &Config) -> Result<(Backup, SnapshotCatalog, ObjectFilter)> {
    let cluster = ClusterConfig::load(&config.cluster_config)?;
    let plugin = config
        .plugin_config
        .as_deref()
        .map(PluginConfig::load)
        .transpose()?;
    let catalog = SnapshotCatalog::load(&config.catalog)?;

    let timestamp = config.timestamp.clone().unwrap_or_else(new_timestamp);
    let coordinator = cluster.coordinator_host();
    let segments = cluster.segment_hosts();
    let mut ctx = RunContext::new(
        DEFAULT_TOOL_NAME,
        timestamp,
        coordinator.clone(),
        segments.clone(),
    )
    .with_compression(config.compression())
    .with_plugin(plugin);
    if let Some(dir) = &config.backup_dir {
        ctx = ctx.with_backup_dir(dir);
    }
    ctx.reader_timeout_secs = config.reader_timeout_secs;

    let filter = ObjectFilter {
        include: config.include_tables.iter().cloned().collect(),
        exclude: config.exclude_tables.iter().cloned().collect(),
        leaf_partition_data: config.leaf_partition_data,
    };

    let session =
        PsqlSession::connect(&config.connection).context("Failed to open catalog session")?;
    let executor = ClusterExecutor::new(coordinator, segments, config.transport);
    Ok((Backup::new(ctx, executor, Box::new(session)), catalog, filter))
}

fn main() -> Result<()> {
    let config = Config::from(Command::parse());
    init_logging(config.verbosity);
    config.validate()?;

    let (backup, catalog, filter) = build_backup(&config)?;
    let backup = Arc::new(backup);
    let unloader = CommandUnloader::new(config.unload_command.clone());

    // None on the channel means Ctrl-C.
    let (done_tx, done_rx) = channel();
    let stop_tx = done_tx.clone();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(None);
    })
    .context("Error setting Ctrl-C handler")?;

    let worker = Arc::clone(&backup);
    thread::spawn(move || {
        let result = worker.execute(&catalog, &unloader, &filter);
        let _ = done_tx.send(Some(result));
    });

    println!("Backup {} started", backup.context().timestamp);
    match done_rx.recv().context("Backup thread exited unexpectedly")? {
        Some(Ok(summary)) => {
            println!(
                "Backup {} complete: {} relations on {} segments",
                summary.timestamp,
                summary.relations.len(),
                summary.segments
            );
            println!("Object plan written to {}", summary.plan_path.display());
            Ok(())
        }
        Some(Err(e)) => Err(anyhow::Error::new(e).context("Backup failed")),
        None => {
            println!("Interrupted, cleaning up...");
            for failure in backup.cleanup(false) {
                eprintln!("{failure}");
            }
            // Let the backup thread return from whatever it was running.
            let deadline = Instant::now() + WORKER_EXIT_GRACE;
            while let Some(left) = deadline.checked_duration_since(Instant::now()) {
                if !matches!(done_rx.recv_timeout(left), Ok(None)) {
                    break;
                }
            }
            process::exit(130);
        }
    }
}
