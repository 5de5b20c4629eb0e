use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tracing::error;

use crate::protocol::TranscriptResult;

/// Terminal status of a processed file, carried by `file.processed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Already present in the index; no worker was consumed
    Skipped,
    /// Transcribed and written to the index
    Success,
    /// Completed without a usable outcome; not retried
    Undefined,
    /// Failed permanently for this run
    Failure,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Skipped => "skipped",
            FileStatus::Success => "success",
            FileStatus::Undefined => "undefined",
            FileStatus::Failure => "failure",
        }
    }
}

/// Typed payload of a lifecycle notification.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// File collection is being set up
    CollectorInit,
    /// Pre-count of the file set has started
    CountingStart { two_pass: bool },
    /// A file was seen during the pre-count
    CountingFound {
        filepath: String,
        files_total: usize,
        files_pending: usize,
    },
    /// Pre-count finished
    CountingDone {
        files_total: usize,
        files_pending: usize,
    },
    /// The orchestrator is about to start pulling files
    ProcessorStarting,
    /// A worker was permanently removed from the pool
    WorkerFired { worker_id: String },
    /// A file reached a terminal state
    FileProcessed {
        filepath: String,
        is_complete: bool,
        result: Option<TranscriptResult>,
        status: FileStatus,
        error: Option<String>,
    },
    /// The whole run finished
    RunFinished {
        results: usize,
        errors: usize,
        skipped: usize,
    },
}

/// A lifecycle notification. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    /// Component that emitted the event
    pub source: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Namespaced event name.
    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::CollectorInit => "collector.init",
            EventKind::CountingStart { .. } => "collector.counting.start",
            EventKind::CountingFound { .. } => "collector.counting.found",
            EventKind::CountingDone { .. } => "collector.counting.done",
            EventKind::ProcessorStarting => "processor.starting",
            EventKind::WorkerFired { .. } => "pool.worker.fired",
            EventKind::FileProcessed { .. } => "file.processed",
            EventKind::RunFinished { .. } => "run.finished",
        }
    }
}

type Subscriber = Box<dyn Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync>;

/// In-process publish/subscribe of lifecycle events.
///
/// Delivery is best-effort and synchronous, in registration order. A
/// subscriber error is logged and swallowed; it never reaches the emitter.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Subscribers are invoked in registration order.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut subscribers = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.push(Box::new(subscriber));
    }

    /// Emit an event to every subscriber.
    pub fn emit(&self, source: &'static str, kind: EventKind) {
        let event = LifecycleEvent {
            kind,
            source,
            timestamp: Utc::now(),
        };
        let subscribers = match self.subscribers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for subscriber in subscribers.iter() {
            if let Err(e) = subscriber(&event) {
                error!(
                    "An error occurred while dispatching event {}: {}. Ignoring.",
                    event.name(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe(move |_| {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        bus.emit("test", EventKind::ProcessorStarting);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_subscriber_error_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| anyhow::bail!("listener exploded"));
        {
            let delivered = Arc::clone(&delivered);
            bus.subscribe(move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        bus.emit("test", EventKind::CollectorInit);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_names() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |ev| {
                seen.lock().unwrap().push(ev.name());
                Ok(())
            });
        }

        bus.emit(
            "pool",
            EventKind::WorkerFired {
                worker_id: "vosk-1".to_string(),
            },
        );
        bus.emit(
            "processor",
            EventKind::FileProcessed {
                filepath: "a.mp4".to_string(),
                is_complete: true,
                result: None,
                status: FileStatus::Skipped,
                error: None,
            },
        );

        assert_eq!(*seen.lock().unwrap(), vec!["pool.worker.fired", "file.processed"]);
    }
}
