use activity_journal::config::PipelineConfig;
use activity_journal::journal::SpoolJournal;
use activity_journal::pipeline::{Pipeline, RunReport};
use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};

/// Exit status of a cancelled continuous run.
pub const EXIT_CANCELLED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "activity-journal")]
#[command(about = "Capture volume change journals into hot and warm activity tiers")]
pub struct Cli {
    /// JSON configuration file; flags override its values.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory of the durable store. Without it state is kept in memory.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Spool directory holding one journal per volume.
    #[arg(long, global = true, default_value = "spool")]
    pub spool: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read journals, resolve entities and maintain the tiers.
    Run(RunArgs),
    /// Print cursors, queue counts, checkpoint and tier sizes as JSON.
    Status,
    /// List dead-lettered resolution entries.
    DeadLetters,
    /// Move every dead-lettered entry back to pending.
    Requeue,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Comma separated volume list, e.g. `C:,D:`.
    #[arg(long, value_delimiter = ',')]
    pub volumes: Vec<String>,

    /// Journal poll interval in seconds.
    #[arg(long)]
    pub interval: Option<u64>,

    /// Hot-tier retention in days.
    #[arg(long)]
    pub ttl_days: Option<u64>,

    /// Transition window in seconds.
    #[arg(long)]
    pub batch_window: Option<u64>,

    #[arg(long)]
    pub max_batch_size: Option<usize>,

    #[arg(long)]
    pub max_resolution_attempts: Option<u32>,

    /// Drop stored cursors so every volume is rescanned.
    #[arg(long)]
    pub reset_cursor: bool,

    /// Run every stage once and exit.
    #[arg(long)]
    pub once: bool,
}

/// File values first, then global flags, then `run` flags.
pub fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load configuration from '{}'", path.display()))?,
        None => PipelineConfig::new(),
    };
    if let Some(dir) = &cli.data_dir {
        config = config.data_dir(dir.clone());
    }
    if let Command::Run(args) = &cli.command {
        config = apply_run_args(config, args);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn apply_run_args(mut config: PipelineConfig, args: &RunArgs) -> PipelineConfig {
    let volumes: Vec<String> = args
        .volumes
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if !volumes.is_empty() {
        config = config.volumes(volumes);
    }
    if let Some(secs) = args.interval {
        config = config.poll_interval(Duration::from_secs(secs));
    }
    if let Some(days) = args.ttl_days {
        config = config.ttl_days(days);
    }
    if let Some(secs) = args.batch_window {
        config = config.batch_window(Duration::from_secs(secs));
    }
    if let Some(size) = args.max_batch_size {
        config = config.max_batch_size(size);
    }
    if let Some(attempts) = args.max_resolution_attempts {
        config = config.max_resolution_attempts(attempts);
    }
    config
}

async fn open_pipeline(cli: &Cli, config: PipelineConfig) -> Result<Arc<Pipeline>> {
    let pipeline = Pipeline::builder(config)
        .spool(SpoolJournal::new(cli.spool.clone()))
        .build()
        .await
        .context("Failed to open pipeline")?;
    Ok(Arc::new(pipeline))
}

pub async fn execute(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let pipeline = open_pipeline(&cli, config).await?;

    match &cli.command {
        Command::Run(args) => run(pipeline, args).await,
        Command::Status => {
            let status = pipeline.status().await.context("Failed to read status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::DeadLetters => {
            let entries = pipeline
                .list_dead_letters()
                .await
                .context("Failed to list dead letters")?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Requeue => {
            let moved = pipeline
                .requeue_dead_letters()
                .await
                .context("Failed to requeue dead letters")?;
            pipeline.checkpoint().await.context("Failed to checkpoint store")?;
            println!("Requeued {moved} dead-lettered entries");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(pipeline: Arc<Pipeline>, args: &RunArgs) -> Result<ExitCode> {
    if pipeline.config().volumes.is_empty() {
        return Err(anyhow!("No volumes configured. Pass --volumes or set `volumes` in the config file"));
    }
    if args.reset_cursor {
        for volume in pipeline.config().volume_ids() {
            let removed = pipeline
                .reset_cursor(&volume)
                .await
                .with_context(|| format!("Failed to reset cursor of volume '{volume}'"))?;
            event!(Level::INFO, volume_id = %volume, removed, "cursor reset requested");
        }
    }

    if args.once {
        let report = pipeline.run_once().await.context("Pipeline run failed")?;
        pipeline.checkpoint().await.context("Failed to checkpoint store")?;
        print_report(&report)?;
        return Ok(if report.is_clean() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let handle = pipeline.start();
    let mut watchdog = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let cancelled = loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("Failed to listen for Ctrl-C")?;
                event!(Level::INFO, "cancellation requested; finishing in-flight work");
                break true;
            }
            _ = watchdog.tick() => {
                let halted = handle.halted();
                if !halted.is_empty() {
                    event!(Level::ERROR, workers = ?halted, "background worker halted");
                    break false;
                }
            }
        }
    };

    handle.shutdown().await.context("Failed to stop pipeline cleanly")?;
    if cancelled {
        Ok(ExitCode::from(EXIT_CANCELLED))
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_report(report: &RunReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    for failure in &report.failures {
        eprintln!("volume {} failed ({}): {}", failure.volume_id, failure.error_kind, failure.error);
    }
    Ok(())
}
