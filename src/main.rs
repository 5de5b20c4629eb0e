use anyhow::{Context, Result};
use bulkscribe::{
    collector::FileCollector,
    config::WorkersFile,
    events::{EventBus, EventKind, FileStatus},
    index::ElasticsearchIndexer,
    pipeline::DryRunMode,
    pool::WorkerPool,
    processor::{FileProcessor, ProgressMode, RunOptions, FILE_MAX_RETRY},
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "bulkscribe")]
#[command(about = "Bulk speech-to-text transcription into a search index")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// The target folder(s) containing the files to index
    #[arg(required = true)]
    pub folders: Vec<PathBuf>,

    /// Included path substring(s)
    #[arg(short = 'I', long = "include")]
    pub include: Vec<String>,

    /// Excluded path substring(s)
    #[arg(short = 'E', long = "exclude")]
    pub exclude: Vec<String>,

    /// Dry-run mode
    #[arg(short = 'N', long, value_enum, default_value = "disabled")]
    pub dry_run: DryRunArg,

    /// Show progress. Notice: needs to count files first.
    #[arg(short = 'p', long, value_enum, default_value = "disabled")]
    pub progress: ProgressArg,

    /// Worker endpoint configuration file (TOML)
    #[arg(long, default_value = "workers.toml")]
    pub workers_config: PathBuf,

    /// Search index base URL
    #[arg(long, default_value = "http://127.0.0.1:9200")]
    pub es_url: String,

    /// Search index name
    #[arg(long, default_value = "bulkscribe")]
    pub es_index: String,

    /// Skip updating the index mapping on startup
    #[arg(long)]
    pub es_skip_mapping_update: bool,

    /// Maximum charged retries per file
    #[arg(long, default_value_t = FILE_MAX_RETRY)]
    pub max_retries: u32,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum DryRunArg {
    Disabled,
    FakeSuccess,
    FakeFailure,
}

impl From<DryRunArg> for DryRunMode {
    fn from(arg: DryRunArg) -> Self {
        match arg {
            DryRunArg::Disabled => DryRunMode::Disabled,
            DryRunArg::FakeSuccess => DryRunMode::FakeSuccess,
            DryRunArg::FakeFailure => DryRunMode::FakeFailure,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum ProgressArg {
    Disabled,
    Simple,
    TwoPass,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Disabled => ProgressMode::Disabled,
            ProgressArg::Simple => ProgressMode::Simple,
            ProgressArg::TwoPass => ProgressMode::TwoPass,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Render lifecycle events on the console: per-file progress lines when
/// progress reporting is enabled, and the final summary always.
fn setup_console_output(events: &EventBus, progress: ProgressMode) {
    let total = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    events.subscribe(move |event| {
        match &event.kind {
            EventKind::CountingStart { two_pass } => {
                if *two_pass {
                    println!("Scanning files against the index...");
                }
            }
            EventKind::CountingDone {
                files_total,
                files_pending,
            } => {
                total.store(*files_pending, Ordering::Relaxed);
                println!(
                    "{} file(s) found, {} pending.",
                    files_total, files_pending
                );
            }
            EventKind::FileProcessed {
                filepath, status, ..
            } => {
                if progress != ProgressMode::Disabled && *status != FileStatus::Skipped {
                    let done = done.fetch_add(1, Ordering::Relaxed) + 1;
                    let total = total.load(Ordering::Relaxed);
                    if total > 0 {
                        println!("[{}/{}] {}: {}", done, total, filepath, status.as_str());
                    } else {
                        println!("[{}] {}: {}", done, filepath, status.as_str());
                    }
                }
            }
            EventKind::RunFinished {
                results,
                errors,
                skipped,
            } => {
                println!("Run complete.");
                println!("{} file(s) have been processed.", results);
                println!("{} file(s) have been skipped.", skipped);
                if *errors > 0 {
                    println!("{} error(s) have been encountered.", errors);
                }
            }
            _ => {}
        }
        Ok(())
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting Bulkscribe v{}", env!("CARGO_PKG_VERSION"));

    let workers = WorkersFile::from_file(&args.workers_config)
        .context("Failed to load worker configuration")?
        .into_worker_configs();
    anyhow::ensure!(
        !workers.is_empty(),
        "No workers configured in {}",
        args.workers_config.display()
    );

    info!("Configuration:");
    info!("  Workers: {}", workers.len());
    info!("  Index: {} at {}", args.es_index, args.es_url);
    info!("  Max retries per file: {}", args.max_retries);

    let events = EventBus::new();
    setup_console_output(&events, args.progress.into());

    let pool = Arc::new(WorkerPool::new(workers, events.clone()));
    let indexer = Arc::new(
        ElasticsearchIndexer::new(&args.es_url, &args.es_index)
            .with_skip_mapping_update(args.es_skip_mapping_update),
    );

    println!("Collecting files to process (it may take some time)...");
    let files = FileCollector::new(args.folders.clone())
        .with_include(args.include.clone())
        .with_exclude(args.exclude.clone())
        .collect()
        .context("Failed to collect files")?;
    info!("{} file(s) collected.", files.len());

    let processor = FileProcessor::new(Arc::clone(&pool), indexer, events.clone())
        .with_max_retries(args.max_retries);

    let options = RunOptions {
        dry_run: args.dry_run.into(),
        progress: args.progress.into(),
    };
    let summary = processor
        .run(files, options)
        .await
        .context("Processing run failed")?;

    pool.shutdown().await;

    if args.dry_run != DryRunArg::Disabled {
        println!("DRY-RUN ENABLED. No file has actually been processed.");
    }
    if summary.errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}
