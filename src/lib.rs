//! Bulkscribe - bulk speech-to-text indexing
//!
//! This crate walks a media file set, streams each file's decoded audio to
//! a pool of remote transcription workers over persistent websocket
//! connections, and hands completed transcripts to a search index. It
//! features:
//!
//! - A fixed worker pool with FIFO-fair acquisition and permanent removal
//!   of workers whose endpoint is confirmed dead
//! - A per-file pipeline pairing a local ffmpeg decode subprocess with a
//!   duplex websocket stream
//! - An orchestrator with failure classification, selective retry and
//!   requeue-before-fresh-file scheduling
//! - Lifecycle events consumed by the CLI front end
//!
//! # Example
//!
//! ```no_run
//! use bulkscribe::{
//!     collector::FileCollector,
//!     events::EventBus,
//!     index::MemoryIndexer,
//!     pool::{WorkerConfig, WorkerPool},
//!     processor::{FileProcessor, RunOptions},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let events = EventBus::new();
//!     let pool = Arc::new(WorkerPool::new(
//!         vec![WorkerConfig::new("vosk-1", "ws://10.0.0.1:2700")],
//!         events.clone(),
//!     ));
//!     let indexer = Arc::new(MemoryIndexer::new());
//!
//!     let files = FileCollector::new(vec!["/media".into()]).collect()?;
//!     let processor = FileProcessor::new(pool.clone(), indexer, events);
//!     let summary = processor.run(files, RunOptions::default()).await?;
//!
//!     println!("{} processed, {} skipped", summary.results, summary.skipped);
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod events;
pub mod index;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod protocol;

// Re-export commonly used types for convenience
pub use collector::{FileCollector, FileMeta};
pub use config::{WorkerConfig, WorkersFile};
pub use events::{EventBus, EventKind, FileStatus, LifecycleEvent};
pub use index::{ElasticsearchIndexer, FileIndexer, MemoryIndexer};
pub use pipeline::{DryRunMode, PipelineError, PoolTask, TranscribeTask};
pub use pool::{PoolError, SubmitError, Worker, WorkerPool};
pub use processor::{FileProcessor, ProgressMode, RunOptions, RunSummary, TaskFactory};
pub use protocol::{TranscriptResult, TranscriptSegment, WordTiming};

// Error types
use thiserror::Error;

/// Errors that can abort a bulkscribe run.
#[derive(Error, Debug)]
pub enum BulkscribeError {
    /// Worker pool scheduling error
    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    /// Per-file pipeline error
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] pipeline::PipelineError),

    /// Search index error
    #[error("Indexer error: {0}")]
    Indexer(#[from] index::IndexerError),

    /// File discovery error
    #[error("Collector error: {0}")]
    Collector(#[from] collector::CollectorError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bulkscribe operations.
pub type Result<T> = std::result::Result<T, BulkscribeError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
