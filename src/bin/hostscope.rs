use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hostscope::{
    actors::{
        bus::EventBus,
        live::{JsonLinesSink, LiveHandle, LiveSink},
        sampler::SamplerHandle,
        storage::{PersistenceOptions, StorageHandle},
    },
    config::{Config, read_config_file},
    sources::SourceSet,
    storage::{self, ExportFormat},
};
use tracing::{debug, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log at TRACE instead of DEBUG
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Sample continuously until interrupted
    Run {
        /// Write every sample to stdout as JSON lines
        #[arg(long)]
        stream: bool,
    },

    /// Take one reading of every enabled source and print it
    Snapshot,

    /// Export persisted telemetry
    Export {
        #[arg(long, default_value_t = ExportFormat::Json)]
        format: ExportFormat,

        /// Inclusive lower bound (unix millis)
        #[arg(long)]
        start: Option<i64>,

        /// Inclusive upper bound (unix millis)
        #[arg(long)]
        end: Option<i64>,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete persisted telemetry older than the given number of days
    Prune {
        #[arg(long)]
        days: u32,
    },
}

fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::DEBUG
    };

    let filter = filter::Targets::new()
        .with_targets(vec![("hostscope", level)])
        .with_default(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = match &args.config {
        Some(path) => read_config_file(path).with_context(|| format!("failed to load {path}"))?,
        None => Config::default(),
    };

    match args.command {
        Command::Run { stream } => run(config, stream).await,
        Command::Snapshot => snapshot(config).await,
        Command::Export {
            format,
            start,
            end,
            output,
        } => export(config, format, start, end, output).await,
        Command::Prune { days } => prune(config, days).await,
    }
}

async fn run(config: Config, stream: bool) -> anyhow::Result<()> {
    let backend = storage::open(&config.storage)
        .await
        .context("failed to open storage")?;
    info!("storage: {}", backend.stats().await?);

    let bus = EventBus::new();

    let storage = StorageHandle::spawn(
        backend,
        PersistenceOptions::from_config(&config.storage),
        &bus,
    );

    let sampler = SamplerHandle::spawn(&config, SourceSet::system(), bus.clone())?;

    let mut sinks: Vec<Box<dyn LiveSink>> = Vec::new();
    if stream {
        sinks.push(Box::new(JsonLinesSink::new(tokio::io::stdout())));
    }
    let live = LiveHandle::spawn(
        config.host_id.clone(),
        &bus,
        sampler.watch_settings(),
        sinks,
    )?;

    sampler.start().await?;
    info!(
        "sampling {} every {} ms",
        config.host_id, config.sampler.sample_interval_ms
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    sampler.shutdown().await?;
    live.shutdown().await?;
    storage.shutdown().await?;

    let stats = bus.stats();
    debug!(
        "bus: {} published, {} delivered, {} failed, deepest queue {}",
        stats.published, stats.delivered, stats.failed, stats.max_queue_depth
    );

    Ok(())
}

async fn snapshot(config: Config) -> anyhow::Result<()> {
    let bus = EventBus::new();
    let sampler = SamplerHandle::spawn(&config, SourceSet::system(), bus)?;

    // CPU usage needs a previous reading, so the first tick only primes it
    sampler.sample_now().await?;
    tokio::time::sleep(config.sampler.sample_interval()).await;
    let data = sampler.sample_now().await?;

    sampler.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

async fn export(
    config: Config,
    format: ExportFormat,
    start: Option<i64>,
    end: Option<i64>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let backend = storage::open(&config.storage)
        .await
        .context("failed to open storage")?;

    let rendered = backend.export(format, start, end).await?;
    backend.close().await?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, rendered)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("exported {} to {}", format, path.display());
        }
        None => println!("{rendered}"),
    }

    Ok(())
}

async fn prune(config: Config, days: u32) -> anyhow::Result<()> {
    let backend = storage::open(&config.storage)
        .await
        .context("failed to open storage")?;

    let report = backend.prune_retention(days).await?;
    backend.close().await?;

    for (kind, deleted) in &report.deleted {
        println!("{kind}: {deleted}");
    }
    println!("deleted {} rows older than {}", report.total(), report.before_ms);

    Ok(())
}
