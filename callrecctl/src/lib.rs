use std::path::PathBuf;
use std::sync::Arc;

use callrec_core::{
    build_prefix, load_config, CallrecConfig, ConversionWorker, DateSelection, DeadLetter,
    DepthProbe, FailureRecord, FfmpegTranscoder, Orchestrator, QueueDepth, RecordingPublisher,
    RunReport, S3ObjectStore, SqliteConversionQueue, SqliteConversionQueueBuilder, WorkerRunner,
    WorkerSettings, WorkerSummary,
};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] callrec_core::ConfigError),
    #[error("queue error: {0}")]
    Queue(#[from] callrec_core::QueueError),
    #[error("run failed: {0}")]
    Run(#[from] callrec_core::OrchestratorError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Batch transcoding of stored call recordings", long_about = None)]
pub struct Cli {
    /// Path to callrec.toml
    #[arg(long, default_value = "configs/callrec.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the key prefix a run would cover
    Prefix(DateArgs),
    /// Run the orchestrator once over one day of recordings
    Run(RunArgs),
    /// Consume conversion jobs from the queue
    Worker(WorkerArgs),
    /// Inspect and repair the conversion queue
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Run the orchestrator every day at the configured hour
    Schedule,
}

#[derive(Args, Debug)]
pub struct DateArgs {
    /// Explicit day to process, MM/DD/YYYY
    #[arg(long)]
    pub date: Option<String>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub date: DateArgs,
    /// List and inspect tags only; publish nothing
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Handle at most one job, then exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
    /// Exit after this many jobs
    #[arg(long)]
    pub max_jobs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Approximate message counts
    Depth,
    /// List dead-lettered jobs
    DeadLetters(LimitArgs),
    /// List recorded conversion failures, newest first
    Failures(LimitArgs),
    /// Move dead-lettered jobs back onto the queue
    Redrive(LimitArgs),
}

#[derive(Args, Debug)]
pub struct LimitArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

/// Installs the global subscriber. `RUST_LOG` wins over the `info` default.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().with_target(false).try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = installed {
        eprintln!("callrecctl: logging disabled, failed to install subscriber: {err}");
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Prefix(args) => {
            let output = context.prefix(args, Utc::now().date_naive())?;
            render(&output, cli.format)?;
        }
        Commands::Run(args) => {
            let output = context.run_once(args).await?;
            render(&output, cli.format)?;
        }
        Commands::Worker(args) => {
            let summary = context.worker(args).await?;
            render(&summary, cli.format)?;
        }
        Commands::Queue(QueueCommands::Depth) => {
            let depth = context.queue_depth().await?;
            render(&depth, cli.format)?;
        }
        Commands::Queue(QueueCommands::DeadLetters(args)) => {
            let letters = context.dead_letters(args.limit)?;
            render(&letters, cli.format)?;
        }
        Commands::Queue(QueueCommands::Failures(args)) => {
            let failures = context.failures(args.limit)?;
            render(&failures, cli.format)?;
        }
        Commands::Queue(QueueCommands::Redrive(args)) => {
            let moved = context.redrive(args.limit)?;
            render(&moved, cli.format)?;
        }
        Commands::Schedule => context.schedule().await?,
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: CallrecConfig,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_config(&cli.config)?;
        info!(path = %cli.config.display(), bucket = %config.store.bucket, "configuration loaded");
        Ok(Self { config })
    }

    fn selection(&self, args: &DateArgs) -> Result<DateSelection> {
        Ok(DateSelection::from_override(
            args.date.as_deref(),
            self.config.listing.num_days_age,
        )?)
    }

    fn queue(&self) -> Result<SqliteConversionQueue> {
        let queue = SqliteConversionQueueBuilder::from_section(&self.config.queue).build()?;
        queue.initialize()?;
        Ok(queue)
    }

    fn prefix(&self, args: &DateArgs, today: NaiveDate) -> Result<PrefixOutput> {
        let selection = self.selection(args)?;
        let date = selection.resolve(today)?;
        Ok(PrefixOutput {
            selection,
            date,
            prefix: build_prefix(&self.config.store.prefix_root, date),
        })
    }

    async fn run_once(&self, args: &RunArgs) -> Result<RunOutput> {
        let selection = self.selection(&args.date)?;
        let today = Utc::now().date_naive();
        let store = Arc::new(S3ObjectStore::connect(&self.config.store).await);
        if args.dry_run {
            info!("dry run: nothing will be published");
            let publisher = Arc::new(RecordingPublisher::new());
            let report = Orchestrator::new(&self.config, store, publisher.clone(), publisher.clone())
                .with_history_path(None)
                .run(selection, today)
                .await?;
            let would_enqueue = publisher
                .published()
                .into_iter()
                .map(|job| job.key)
                .collect();
            return Ok(RunOutput {
                report,
                dry_run: true,
                would_enqueue,
            });
        }
        let queue = Arc::new(self.queue()?);
        let report = Orchestrator::new(&self.config, store, queue.clone(), queue)
            .run(selection, today)
            .await?;
        Ok(RunOutput {
            report,
            dry_run: false,
            would_enqueue: Vec::new(),
        })
    }

    async fn worker(&self, args: &WorkerArgs) -> Result<WorkerSummary> {
        let store = Arc::new(S3ObjectStore::connect(&self.config.store).await);
        let transcoder = Arc::new(FfmpegTranscoder::new(&self.config.convert));
        let worker = ConversionWorker::new(
            store,
            transcoder,
            WorkerSettings::from_config(&self.config),
        );
        let runner = WorkerRunner::new(
            Arc::new(self.queue()?),
            worker,
            self.config.queue.idle_poll_interval(),
        );
        let (max_jobs, stop_when_idle) = if args.once {
            (Some(1), true)
        } else {
            (args.max_jobs, false)
        };
        Ok(runner.run(max_jobs, stop_when_idle).await?)
    }

    async fn queue_depth(&self) -> Result<QueueDepth> {
        Ok(self.queue()?.approximate_depth().await?)
    }

    fn dead_letters(&self, limit: usize) -> Result<DeadLetterList> {
        Ok(DeadLetterList {
            rows: self.queue()?.dead_letters(limit)?,
        })
    }

    fn failures(&self, limit: usize) -> Result<FailureList> {
        Ok(FailureList {
            rows: self.queue()?.failures(limit)?,
        })
    }

    fn redrive(&self, limit: usize) -> Result<RedriveOutput> {
        Ok(RedriveOutput {
            moved: self.queue()?.redrive(limit)?,
        })
    }

    async fn schedule(&self) -> Result<()> {
        let store = Arc::new(S3ObjectStore::connect(&self.config.store).await);
        let queue = Arc::new(self.queue()?);
        let orchestrator = Orchestrator::new(&self.config, store, queue.clone(), queue);
        callrec_core::schedule::run_daily(
            &orchestrator,
            self.config.schedule.hour_utc,
            self.config.listing.num_days_age,
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PrefixOutput {
    selection: DateSelection,
    date: NaiveDate,
    prefix: String,
}

impl DisplayFallback for PrefixOutput {
    fn display(&self) -> String {
        format!("{} ({})", self.prefix, self.date)
    }
}

#[derive(Debug, Serialize)]
struct RunOutput {
    #[serde(flatten)]
    report: RunReport,
    dry_run: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    would_enqueue: Vec<String>,
}

impl DisplayFallback for RunOutput {
    fn display(&self) -> String {
        let report = &self.report;
        let mut lines = vec![
            format!("Run {} over {}", report.run_id, report.prefix),
            format!("  outcome: {:?}", report.outcome),
            format!("  pages listed: {}", report.pages_listed),
            format!(
                "  enqueued: {} | skipped tagged: {} | skipped extension: {}",
                report.stats.enqueued,
                report.stats.skipped_tagged,
                report.stats.skipped_wrong_extension
            ),
            format!("  drain waits: {}", report.drain_waits),
        ];
        for caught in &report.caught_errors {
            lines.push(format!(
                "  caught on page {} ({:?}): {}",
                caught.page, caught.class, caught.error
            ));
        }
        if self.dry_run {
            lines.push("  dry run, would enqueue:".to_string());
            for key in &self.would_enqueue {
                lines.push(format!("    - {key}"));
            }
        }
        lines.join("\n")
    }
}

impl DisplayFallback for WorkerSummary {
    fn display(&self) -> String {
        format!(
            "processed: {} | converted: {} | already converted: {} | failed: {}",
            self.processed, self.converted, self.already_converted, self.failed
        )
    }
}

impl DisplayFallback for QueueDepth {
    fn display(&self) -> String {
        format!(
            "visible: {} | delayed: {} | in flight: {}",
            self.visible, self.delayed, self.in_flight
        )
    }
}

#[derive(Debug, Serialize)]
struct DeadLetterList {
    rows: Vec<DeadLetter>,
}

impl DisplayFallback for DeadLetterList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No dead letters".to_string();
        }
        self.rows
            .iter()
            .map(|letter| {
                format!(
                    "{} | receives={} | dead-lettered {} | {}",
                    letter.message_id,
                    letter.receive_count,
                    letter.dead_lettered_at.to_rfc3339(),
                    letter.body
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
struct FailureList {
    rows: Vec<FailureRecord>,
}

impl DisplayFallback for FailureList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No recorded failures".to_string();
        }
        self.rows
            .iter()
            .map(|failure| {
                format!(
                    "{} | {} | stage={} | receive={} | {}",
                    failure.failed_at.to_rfc3339(),
                    failure.object_key.as_deref().unwrap_or("<undecodable>"),
                    failure.stage,
                    failure.receive_count,
                    failure.error
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
struct RedriveOutput {
    moved: usize,
}

impl DisplayFallback for RedriveOutput {
    fn display(&self) -> String {
        format!("Redrove {} dead letter(s)", self.moved)
    }
}
