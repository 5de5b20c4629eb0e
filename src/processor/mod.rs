use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::collector::FileMeta;
use crate::events::{EventBus, EventKind, FileStatus};
use crate::index::{document_key, FileIndexer, IndexerError};
use crate::pipeline::{DryRunMode, PipelineError, PoolTask, TranscribeTask};
use crate::pool::{PoolError, SubmitError, WorkerPool};

/// Maximum number of charged retries per file.
pub const FILE_MAX_RETRY: u32 = 3;

/// Fixed backoff before retrying a mid-stream communication failure.
const STREAM_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Poll interval while the primary source is drained but work is still
/// in flight.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Progress reporting strategy for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    #[default]
    Disabled,
    /// Report the raw file count only
    Simple,
    /// Pre-scan every file against the index before starting, for
    /// accurate pending totals
    TwoPass,
}

/// Options consumed by the orchestrator, produced by the CLI layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: DryRunMode,
    pub progress: ProgressMode,
}

/// Aggregated counts of a finished run. Each attempt counts once: a file
/// that failed twice before succeeding contributes two errors and one
/// result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub results: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// Creates the per-file unit of work submitted to the pool.
pub trait TaskFactory: Send + Sync {
    fn create(&self, file: &FileMeta, dry_run: DryRunMode) -> Arc<dyn PoolTask>;
}

/// Default factory producing the real transcription pipeline.
#[derive(Debug, Default)]
pub struct TranscribeTaskFactory;

impl TaskFactory for TranscribeTaskFactory {
    fn create(&self, file: &FileMeta, dry_run: DryRunMode) -> Arc<dyn PoolTask> {
        Arc::new(TranscribeTask::new(file.path.clone(), dry_run))
    }
}

/// Shared context handed to each spawned per-file task.
#[derive(Clone)]
struct TaskCtx {
    pool: Arc<WorkerPool>,
    indexer: Arc<dyn FileIndexer>,
    task_factory: Arc<dyn TaskFactory>,
    events: EventBus,
    requeue: UnboundedSender<FileMeta>,
    retries: Arc<Mutex<HashMap<PathBuf, u32>>>,
    in_flight: Arc<AtomicUsize>,
    max_retries: u32,
    stream_backoff: Duration,
    dry_run: DryRunMode,
}

/// Decrements the in-flight counter when a per-file task ends, however
/// it ends.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Orchestrates a run: merges the file sequence with the requeue channel,
/// bounds concurrency through the worker pool, classifies failures and
/// aggregates the final counts.
pub struct FileProcessor {
    pool: Arc<WorkerPool>,
    indexer: Arc<dyn FileIndexer>,
    task_factory: Arc<dyn TaskFactory>,
    events: EventBus,
    max_retries: u32,
    stream_backoff: Duration,
    poll_interval: Duration,
    requeue_tx: UnboundedSender<FileMeta>,
    requeue_rx: Mutex<UnboundedReceiver<FileMeta>>,
    retries: Arc<Mutex<HashMap<PathBuf, u32>>>,
    in_flight: Arc<AtomicUsize>,
}

impl FileProcessor {
    pub fn new(pool: Arc<WorkerPool>, indexer: Arc<dyn FileIndexer>, events: EventBus) -> Self {
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        Self {
            pool,
            indexer,
            task_factory: Arc::new(TranscribeTaskFactory),
            events,
            max_retries: FILE_MAX_RETRY,
            stream_backoff: STREAM_RETRY_BACKOFF,
            poll_interval: DRAIN_POLL_INTERVAL,
            requeue_tx,
            requeue_rx: Mutex::new(requeue_rx),
            retries: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_task_factory(mut self, task_factory: Arc<dyn TaskFactory>) -> Self {
        self.task_factory = task_factory;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_stream_backoff(mut self, backoff: Duration) -> Self {
        self.stream_backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Process a file set to completion.
    pub async fn run(
        &self,
        files: Vec<FileMeta>,
        options: RunOptions,
    ) -> Result<RunSummary, IndexerError> {
        if options.dry_run != DryRunMode::Disabled {
            warn!("DRY-RUN ENABLED");
        }

        info!("Initializing the file indexer...");
        self.indexer.init().await?;
        info!("File indexer initialization complete.");

        let already_indexed = self.setup_collector(&files, options.progress).await?;

        self.events.emit("processor", EventKind::ProcessorStarting);

        let mut primary = files.into_iter();
        let mut skipped = 0usize;
        let mut handles = Vec::new();

        while let Some(file) = self.next_file(&mut primary).await {
            let needs_indexing = match &already_indexed {
                Some(set) => !set.contains(&document_key(&file)),
                None => self.indexer.should_index(&file).await?,
            };
            if !needs_indexing {
                info!("File already indexed, skipping: {}", file.relative_path);
                skipped += 1;
                self.events.emit(
                    "processor",
                    EventKind::FileProcessed {
                        filepath: file.relative_path.clone(),
                        is_complete: true,
                        result: None,
                        status: FileStatus::Skipped,
                        error: None,
                    },
                );
                continue;
            }

            info!("Found file: {}. Adding to queue.", file.relative_path);
            let ctx = self.task_ctx(options.dry_run);
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            handles.push(tokio::spawn(process_file(ctx, file)));
        }

        let mut results = 0usize;
        let mut errors = 0usize;
        for outcome in join_all(handles).await {
            match outcome {
                Ok(Ok(())) => results += 1,
                Ok(Err(_)) => errors += 1,
                Err(e) => {
                    error!("A file task ended abnormally: {}", e);
                    errors += 1;
                }
            }
        }

        self.events.emit(
            "processor",
            EventKind::RunFinished {
                results,
                errors,
                skipped,
            },
        );

        info!("Run complete.");
        info!("{} file(s) have been processed.", results);
        info!("{} file(s) have been skipped.", skipped);
        info!("{} error(s) have been encountered.", errors);
        if options.dry_run != DryRunMode::Disabled {
            warn!("DRY-RUN ENABLED. No file has actually been processed.");
        }

        Ok(RunSummary {
            results,
            errors,
            skipped,
        })
    }

    /// Emit collection events and, in two-pass mode, pre-scan the file
    /// set against the index. Two-pass runs reuse the pre-scanned set as
    /// the main loop's skip predicate; other modes query the index live
    /// per file.
    async fn setup_collector(
        &self,
        files: &[FileMeta],
        progress: ProgressMode,
    ) -> Result<Option<HashSet<String>>, IndexerError> {
        self.events.emit("collector", EventKind::CollectorInit);

        match progress {
            ProgressMode::Disabled => Ok(None),
            ProgressMode::Simple => {
                self.events
                    .emit("collector", EventKind::CountingStart { two_pass: false });
                let total = files.len();
                self.events.emit(
                    "collector",
                    EventKind::CountingDone {
                        files_total: total,
                        files_pending: total,
                    },
                );
                Ok(None)
            }
            ProgressMode::TwoPass => {
                self.events
                    .emit("collector", EventKind::CountingStart { two_pass: true });
                let mut already = HashSet::new();
                let mut total = 0usize;
                for file in files {
                    total += 1;
                    if !self.indexer.should_index(file).await? {
                        already.insert(document_key(file));
                    }
                    self.events.emit(
                        "collector",
                        EventKind::CountingFound {
                            filepath: file.relative_path.clone(),
                            files_total: total,
                            files_pending: total - already.len(),
                        },
                    );
                }
                self.events.emit(
                    "collector",
                    EventKind::CountingDone {
                        files_total: total,
                        files_pending: total - already.len(),
                    },
                );
                Ok(Some(already))
            }
        }
    }

    /// Pull the next file, requeued files strictly first. The sequence
    /// ends only once the primary source is drained, the requeue channel
    /// is empty and no task is in flight; while tasks are in flight the
    /// loop polls, since any of them may still produce a requeue.
    async fn next_file(&self, primary: &mut std::vec::IntoIter<FileMeta>) -> Option<FileMeta> {
        let mut drained_logged = false;
        loop {
            if let Ok(file) = self.requeue_rx.lock().await.try_recv() {
                return Some(file);
            }
            if let Some(file) = primary.next() {
                return Some(file);
            }
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                // A task requeues before it is counted done, so one last
                // look at the channel suffices
                return self.requeue_rx.lock().await.try_recv().ok();
            }
            if !drained_logged {
                info!("No more new files to process. Waiting for the current pool to complete.");
                drained_logged = true;
            }
            sleep(self.poll_interval).await;
        }
    }

    fn task_ctx(&self, dry_run: DryRunMode) -> TaskCtx {
        TaskCtx {
            pool: Arc::clone(&self.pool),
            indexer: Arc::clone(&self.indexer),
            task_factory: Arc::clone(&self.task_factory),
            events: self.events.clone(),
            requeue: self.requeue_tx.clone(),
            retries: Arc::clone(&self.retries),
            in_flight: Arc::clone(&self.in_flight),
            max_retries: self.max_retries,
            stream_backoff: self.stream_backoff,
            dry_run,
        }
    }
}

/// One attempt at one file, run as a background task.
async fn process_file(ctx: TaskCtx, file: FileMeta) -> Result<(), String> {
    let _guard = InFlightGuard(Arc::clone(&ctx.in_flight));
    run_attempt(&ctx, &file).await
}

async fn run_attempt(ctx: &TaskCtx, file: &FileMeta) -> Result<(), String> {
    let task = ctx.task_factory.create(file, ctx.dry_run);

    match ctx.pool.submit(task.as_ref()).await {
        Ok(result) => match ctx.indexer.index_file(file, &result).await {
            Ok(()) => {
                info!("Execution COMPLETE for {}", file.relative_path);
                ctx.events.emit(
                    "processor",
                    EventKind::FileProcessed {
                        filepath: file.relative_path.clone(),
                        is_complete: true,
                        result: Some(result),
                        status: FileStatus::Success,
                        error: None,
                    },
                );
                Ok(())
            }
            Err(e) => {
                // An index write failure is charged like any other error
                let message = format!("failed indexing {}: {}", file.relative_path, e);
                error!("Execution FAILED for {}: {}", file.relative_path, e);
                finish_failed_attempt(ctx, file, message, try_requeue(ctx, file, true).await)
            }
        },

        Err(SubmitError::Task(err)) => {
            let message = err.to_string();
            error!("Execution FAILED for {}: {}", file.relative_path, message);
            let retried = match retry_policy(&err) {
                // The fault belongs to the worker, not the file: requeue
                // without charging the file's retry budget
                RetryPolicy::Uncharged => try_requeue(ctx, file, false).await,
                RetryPolicy::ChargedBackoff => {
                    sleep(ctx.stream_backoff).await;
                    try_requeue(ctx, file, true).await
                }
                RetryPolicy::Charged => try_requeue(ctx, file, true).await,
            };
            finish_failed_attempt(ctx, file, message, retried)
        }

        Err(SubmitError::Pool(PoolError::Exhausted)) => {
            let message = PoolError::Exhausted.to_string();
            error!("Execution FAILED for {}: {}", file.relative_path, message);
            finish_failed_attempt(ctx, file, message, false)
        }

        Err(SubmitError::Pool(PoolError::Shutdown)) => {
            warn!(
                "Execution UNDEFINED for {} (pool shut down)",
                file.relative_path
            );
            ctx.events.emit(
                "processor",
                EventKind::FileProcessed {
                    filepath: file.relative_path.clone(),
                    is_complete: true,
                    result: None,
                    status: FileStatus::Undefined,
                    error: Some(PoolError::Shutdown.to_string()),
                },
            );
            Ok(())
        }
    }
}

fn finish_failed_attempt(
    ctx: &TaskCtx,
    file: &FileMeta,
    message: String,
    retried: bool,
) -> Result<(), String> {
    if retried {
        info!("{} can be retried, requeueing.", file.relative_path);
    } else {
        error!(
            "Max attempts reached for file {}, skipping.",
            file.relative_path
        );
        ctx.events.emit(
            "processor",
            EventKind::FileProcessed {
                filepath: file.relative_path.clone(),
                is_complete: true,
                result: None,
                status: FileStatus::Failure,
                error: Some(message.clone()),
            },
        );
    }
    Err(message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryPolicy {
    /// Requeue without charging the file's retry budget
    Uncharged,
    /// Back off, then requeue with a budget charge
    ChargedBackoff,
    /// Requeue immediately with a budget charge
    Charged,
}

fn retry_policy(err: &PipelineError) -> RetryPolicy {
    match err {
        PipelineError::EndpointUnavailable { .. } => RetryPolicy::Uncharged,
        PipelineError::Stream { .. } => RetryPolicy::ChargedBackoff,
        _ => RetryPolicy::Charged,
    }
}

/// Re-enqueue a file for a later pass. Charged requeues are refused once
/// the file's retry counter has reached the maximum; uncharged requeues
/// always go through.
async fn try_requeue(ctx: &TaskCtx, file: &FileMeta, charge: bool) -> bool {
    if charge {
        let mut retries = ctx.retries.lock().await;
        let count = retries.entry(file.path.clone()).or_insert(0);
        if *count >= ctx.max_retries {
            return false;
        }
        *count += 1;
    }
    ctx.requeue.send(file.clone()).is_ok()
}
