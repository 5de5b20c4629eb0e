use async_trait::async_trait;
use bulkscribe::{
    collector::FileMeta,
    events::{EventBus, EventKind, FileStatus, LifecycleEvent},
    index::MemoryIndexer,
    pipeline::{DryRunMode, PipelineError, PoolTask},
    pool::{WorkerConfig, WorkerPool},
    processor::{FileProcessor, ProgressMode, RunOptions, TaskFactory},
    protocol::TranscriptResult,
};
use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn file_meta(relative: &str) -> FileMeta {
    FileMeta {
        path: PathBuf::from(format!("/media/{}", relative)),
        relative_path: relative.to_string(),
        size: 64,
        mtime: Utc::now(),
    }
}

fn pool_of(n: usize, events: &EventBus) -> Arc<WorkerPool> {
    let configs = (1..=n)
        .map(|i| WorkerConfig::new(format!("w{}", i), format!("ws://10.0.0.{}:2700", i)))
        .collect();
    Arc::new(WorkerPool::new(configs, events.clone()))
}

fn recording_bus() -> (EventBus, Arc<Mutex<Vec<LifecycleEvent>>>) {
    let events = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let log = Arc::clone(&log);
        events.subscribe(move |event| {
            log.lock().unwrap().push(event.clone());
            Ok(())
        });
    }
    (events, log)
}

fn count_processed(log: &[LifecycleEvent], wanted: FileStatus) -> usize {
    log.iter()
        .filter(|ev| matches!(&ev.kind, EventKind::FileProcessed { status, .. } if *status == wanted))
        .count()
}

fn count_named(log: &[LifecycleEvent], name: &str) -> usize {
    log.iter().filter(|ev| ev.name() == name).count()
}

/// Replays a fixed sequence of attempt outcomes, then succeeds forever.
#[derive(Clone, Copy, Debug)]
enum Attempt {
    Succeed,
    Unavailable,
    Stream,
    Decode,
}

struct ScriptedFactory {
    outcomes: Arc<Mutex<VecDeque<Attempt>>>,
    attempts: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    fn new(outcomes: impl IntoIterator<Item = Attempt>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn attempts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attempts)
    }
}

impl TaskFactory for ScriptedFactory {
    fn create(&self, file: &FileMeta, _dry_run: DryRunMode) -> Arc<dyn PoolTask> {
        Arc::new(ScriptedTask {
            outcomes: Arc::clone(&self.outcomes),
            attempts: Arc::clone(&self.attempts),
            path: file.path.to_string_lossy().to_string(),
        })
    }
}

struct ScriptedTask {
    outcomes: Arc<Mutex<VecDeque<Attempt>>>,
    attempts: Arc<AtomicUsize>,
    path: String,
}

#[async_trait]
impl PoolTask for ScriptedTask {
    async fn run(&self, worker: &WorkerConfig) -> Result<TranscriptResult, PipelineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Succeed);
        match next {
            Attempt::Succeed => Ok(TranscriptResult::new(&worker.id, &self.path)),
            Attempt::Unavailable => Err(PipelineError::EndpointUnavailable {
                url: worker.url.clone(),
                reason: "scripted".to_string(),
            }),
            Attempt::Stream => Err(PipelineError::Stream {
                url: worker.url.clone(),
                reason: "scripted".to_string(),
            }),
            Attempt::Decode => Err(PipelineError::Decode { code: 1 }),
        }
    }
}

fn fast(processor: FileProcessor) -> FileProcessor {
    processor
        .with_poll_interval(Duration::from_millis(20))
        .with_stream_backoff(Duration::from_millis(10))
}

#[tokio::test]
async fn test_all_indexed_yields_zero_submissions() {
    let (events, log) = recording_bus();
    let pool = pool_of(2, &events);
    let indexer = Arc::new(MemoryIndexer::with_existing(["a.mp4", "b.mp4", "c.mp4"]));

    let processor = fast(FileProcessor::new(
        Arc::clone(&pool),
        indexer.clone(),
        events.clone(),
    ));
    let files = vec![file_meta("a.mp4"), file_meta("b.mp4"), file_meta("c.mp4")];
    let summary = processor.run(files, RunOptions::default()).await.unwrap();

    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.results, 0);
    assert_eq!(summary.errors, 0);
    assert_eq!(indexer.document_count().await, 0);
    // No worker slot was ever consumed
    assert_eq!(pool.worker_count().await, 2);
    assert_eq!(pool.idle_count().await, 2);

    let log = log.lock().unwrap();
    assert_eq!(count_processed(&log, FileStatus::Skipped), 3);
    assert_eq!(count_named(&log, "pool.worker.fired"), 0);
    assert_eq!(count_named(&log, "run.finished"), 1);
}

#[tokio::test]
async fn test_fake_success_indexes_every_file() {
    let (events, log) = recording_bus();
    let pool = pool_of(2, &events);
    let indexer = Arc::new(MemoryIndexer::new());

    let processor = fast(FileProcessor::new(
        Arc::clone(&pool),
        indexer.clone(),
        events.clone(),
    ));
    let files = vec![file_meta("a.mp4"), file_meta("b.mp4")];
    let options = RunOptions {
        dry_run: DryRunMode::FakeSuccess,
        ..Default::default()
    };
    let summary = processor.run(files, options).await.unwrap();

    assert_eq!(summary.results, 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(indexer.document_count().await, 2);

    let log = log.lock().unwrap();
    assert_eq!(count_processed(&log, FileStatus::Success), 2);
}

#[tokio::test]
async fn test_fake_failure_fires_worker_and_exhausts_pool() {
    let (events, log) = recording_bus();
    let pool = pool_of(1, &events);
    let indexer = Arc::new(MemoryIndexer::new());

    let processor = fast(FileProcessor::new(
        Arc::clone(&pool),
        indexer.clone(),
        events.clone(),
    ));
    let files = vec![file_meta("a.mp4"), file_meta("b.mp4"), file_meta("c.mp4")];
    let options = RunOptions {
        dry_run: DryRunMode::FakeFailure,
        ..Default::default()
    };
    let summary = processor.run(files, options).await.unwrap();

    // The first attempt hits endpoint-unavailable and is requeued without
    // charge; by then the only worker is fired, so that retry and the two
    // remaining files all fail on the empty pool.
    assert_eq!(summary.results, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.errors, 4);
    assert_eq!(pool.worker_count().await, 0);
    assert_eq!(indexer.document_count().await, 0);

    let log = log.lock().unwrap();
    assert_eq!(count_named(&log, "pool.worker.fired"), 1);
    assert_eq!(count_processed(&log, FileStatus::Failure), 3);
}

#[tokio::test]
async fn test_retry_budget_bounds_attempts() {
    let (events, log) = recording_bus();
    let pool = pool_of(1, &events);
    let indexer = Arc::new(MemoryIndexer::new());

    // Every attempt fails with a generic (charged) error
    let factory = ScriptedFactory::new([
        Attempt::Decode,
        Attempt::Decode,
        Attempt::Decode,
        Attempt::Decode,
        Attempt::Decode,
        Attempt::Decode,
    ]);
    let attempts = factory.attempts();

    let processor = fast(
        FileProcessor::new(Arc::clone(&pool), indexer.clone(), events.clone())
            .with_task_factory(Arc::new(factory))
            .with_max_retries(2),
    );
    let summary = processor
        .run(vec![file_meta("a.mp4")], RunOptions::default())
        .await
        .unwrap();

    // One initial attempt plus two charged retries
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(summary.errors, 3);
    assert_eq!(summary.results, 0);

    let log = log.lock().unwrap();
    assert_eq!(count_processed(&log, FileStatus::Failure), 1);
    assert_eq!(count_processed(&log, FileStatus::Success), 0);
}

#[tokio::test]
async fn test_stream_failures_back_off_then_succeed() {
    let (events, log) = recording_bus();
    let pool = pool_of(1, &events);
    let indexer = Arc::new(MemoryIndexer::new());

    let factory = ScriptedFactory::new([Attempt::Stream, Attempt::Stream, Attempt::Succeed]);
    let attempts = factory.attempts();

    let processor = fast(
        FileProcessor::new(Arc::clone(&pool), indexer.clone(), events.clone())
            .with_task_factory(Arc::new(factory))
            .with_max_retries(3),
    );
    let summary = processor
        .run(vec![file_meta("a.mp4")], RunOptions::default())
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(summary.results, 1);
    assert_eq!(summary.errors, 2);
    assert_eq!(indexer.document_count().await, 1);

    // Mid-stream failures never fire the worker
    assert_eq!(pool.worker_count().await, 1);
    let log = log.lock().unwrap();
    assert_eq!(count_named(&log, "pool.worker.fired"), 0);
    assert_eq!(count_processed(&log, FileStatus::Success), 1);
    assert_eq!(count_processed(&log, FileStatus::Failure), 0);
}

#[tokio::test]
async fn test_endpoint_unavailable_does_not_consume_budget() {
    let (events, log) = recording_bus();
    let pool = pool_of(3, &events);
    let indexer = Arc::new(MemoryIndexer::new());

    let factory = ScriptedFactory::new([
        Attempt::Unavailable,
        Attempt::Unavailable,
        Attempt::Succeed,
    ]);
    let attempts = factory.attempts();

    // Zero charged retries allowed: only uncharged requeues can explain
    // the file still being retried to success.
    let processor = fast(
        FileProcessor::new(Arc::clone(&pool), indexer.clone(), events.clone())
            .with_task_factory(Arc::new(factory))
            .with_max_retries(0),
    );
    let summary = processor
        .run(vec![file_meta("a.mp4")], RunOptions::default())
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(summary.results, 1);
    assert_eq!(summary.errors, 2);

    // Each endpoint-unavailable failure fired one worker
    assert_eq!(pool.worker_count().await, 1);
    let log = log.lock().unwrap();
    assert_eq!(count_named(&log, "pool.worker.fired"), 2);
    assert_eq!(count_processed(&log, FileStatus::Success), 1);
}

#[tokio::test]
async fn test_two_pass_progress_reports_accurate_totals() {
    let (events, log) = recording_bus();
    let pool = pool_of(2, &events);
    let indexer = Arc::new(MemoryIndexer::with_existing(["b.mp4"]));

    let processor = fast(FileProcessor::new(
        Arc::clone(&pool),
        indexer.clone(),
        events.clone(),
    ));
    let files = vec![file_meta("a.mp4"), file_meta("b.mp4"), file_meta("c.mp4")];
    let options = RunOptions {
        dry_run: DryRunMode::FakeSuccess,
        progress: ProgressMode::TwoPass,
    };
    let summary = processor.run(files, options).await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.results, 2);

    let log = log.lock().unwrap();
    let done = log
        .iter()
        .find_map(|ev| match &ev.kind {
            EventKind::CountingDone {
                files_total,
                files_pending,
            } => Some((*files_total, *files_pending)),
            _ => None,
        })
        .expect("counting.done event missing");
    // The pre-scan total matches what the run actually did
    assert_eq!(done, (3, 2));
    assert_eq!(done.1, summary.results);
    assert_eq!(count_named(&log, "collector.counting.found"), 3);
    assert_eq!(count_named(&log, "collector.counting.start"), 1);
}

#[tokio::test]
async fn test_failed_file_is_requeued_and_recovers() {
    // One worker serializes everything; the first file fails once with a
    // mid-stream error, is requeued, and still ends up indexed.
    let (events, _log) = recording_bus();
    let pool = pool_of(1, &events);
    let indexer = Arc::new(MemoryIndexer::new());

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    struct OrderTrackingFactory {
        order: Arc<Mutex<Vec<String>>>,
        failed_once: Arc<AtomicUsize>,
    }

    struct OrderTrackingTask {
        order: Arc<Mutex<Vec<String>>>,
        failed_once: Arc<AtomicUsize>,
        relative: String,
    }

    impl TaskFactory for OrderTrackingFactory {
        fn create(&self, file: &FileMeta, _dry_run: DryRunMode) -> Arc<dyn PoolTask> {
            Arc::new(OrderTrackingTask {
                order: Arc::clone(&self.order),
                failed_once: Arc::clone(&self.failed_once),
                relative: file.relative_path.clone(),
            })
        }
    }

    #[async_trait]
    impl PoolTask for OrderTrackingTask {
        async fn run(&self, worker: &WorkerConfig) -> Result<TranscriptResult, PipelineError> {
            self.order.lock().unwrap().push(self.relative.clone());
            if self.relative == "a.mp4" && self.failed_once.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(PipelineError::Stream {
                    url: worker.url.clone(),
                    reason: "scripted".to_string(),
                });
            }
            Ok(TranscriptResult::new(&worker.id, &self.relative))
        }
    }

    let factory = OrderTrackingFactory {
        order: Arc::clone(&order),
        failed_once: Arc::new(AtomicUsize::new(0)),
    };

    let processor = fast(
        FileProcessor::new(Arc::clone(&pool), indexer.clone(), events.clone())
            .with_task_factory(Arc::new(factory)),
    );

    // A long tail of fresh files behind the failing one
    let files: Vec<FileMeta> = ["a.mp4", "b.mp4", "c.mp4", "d.mp4", "e.mp4"]
        .iter()
        .map(|name| file_meta(name))
        .collect();
    let summary = processor.run(files, RunOptions::default()).await.unwrap();

    assert_eq!(summary.results, 5);
    assert_eq!(summary.errors, 1);
    assert_eq!(indexer.document_count().await, 5);

    // The failing file was attempted exactly twice, everything else once
    let order = order.lock().unwrap();
    assert_eq!(order.len(), 6);
    assert_eq!(order.iter().filter(|p| p.as_str() == "a.mp4").count(), 2);
}
