use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::events::{EventBus, EventKind};
use crate::pipeline::{PipelineError, PoolTask};
use crate::protocol::TranscriptResult;

pub use crate::config::WorkerConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was shut down before the request could be served
    #[error("the pool was shut down before the task could be executed")]
    Shutdown,
    /// Every worker has been fired; nothing is left to serve requests
    #[error("no (more) available workers in the pool")]
    Exhausted,
}

/// Outcome of a `submit` call: either a pipeline failure or a pool-level
/// scheduling failure.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Task(#[from] PipelineError),
}

/// Runtime handle bound to one worker configuration.
///
/// Owns no file-specific state between tasks. Once killed (fired or shut
/// down) a worker never runs again.
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
    running: AtomicBool,
}

impl Worker {
    fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            running: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn kill(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Busy,
    /// Detached: fired or found dead. Never reused.
    Dead,
}

struct WorkerSlot {
    worker: Arc<Worker>,
    state: SlotState,
}

struct PoolState {
    slots: Vec<WorkerSlot>,
    /// Indices of idle workers, oldest first
    idle: VecDeque<usize>,
    /// Callers blocked in `acquire`, in request order
    waiting: VecDeque<oneshot::Sender<Result<usize, PoolError>>>,
    shutdown: bool,
}

impl PoolState {
    fn attached_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != SlotState::Dead)
            .count()
    }

    fn busy_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Busy)
            .count()
    }

    fn slot_of(&self, worker: &Arc<Worker>) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| Arc::ptr_eq(&s.worker, worker))
    }

    fn fail_waiters(&mut self, error: PoolError) {
        while let Some(waiter) = self.waiting.pop_front() {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

/// Fixed pool of remote-capable workers with mutually-exclusive access.
///
/// Callers are served in FIFO order of request arrival. A released worker
/// is handed directly to the longest-waiting caller when one exists,
/// never parked on the idle queue first. Fired workers are detached
/// permanently; pool capacity only shrinks within a run.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    drained: Notify,
    events: EventBus,
}

impl WorkerPool {
    pub fn new(configs: Vec<WorkerConfig>, events: EventBus) -> Self {
        let mut slots = Vec::with_capacity(configs.len());
        let mut idle = VecDeque::with_capacity(configs.len());
        for (index, config) in configs.into_iter().enumerate() {
            info!("New worker registered successfully: {}", config.id);
            slots.push(WorkerSlot {
                worker: Arc::new(Worker::new(config)),
                state: SlotState::Idle,
            });
            idle.push_back(index);
        }

        Self {
            state: Mutex::new(PoolState {
                slots,
                idle,
                waiting: VecDeque::new(),
                shutdown: false,
            }),
            drained: Notify::new(),
            events,
        }
    }

    /// Number of attached workers. Monotonically non-increasing.
    pub async fn worker_count(&self) -> usize {
        self.state.lock().await.attached_count()
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    pub async fn busy_count(&self) -> usize {
        self.state.lock().await.busy_count()
    }

    pub async fn waiting_count(&self) -> usize {
        self.state.lock().await.waiting.len()
    }

    pub async fn is_running(&self) -> bool {
        !self.state.lock().await.shutdown
    }

    /// Acquire exclusive access to a worker, suspending until one becomes
    /// available when none is idle.
    pub async fn acquire(&self) -> Result<Arc<Worker>, PoolError> {
        loop {
            let receiver = {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return Err(PoolError::Shutdown);
                }
                if state.attached_count() == 0 {
                    debug!("Cannot pull worker from an empty pool");
                    return Err(PoolError::Exhausted);
                }

                loop {
                    let Some(index) = state.idle.pop_front() else {
                        break;
                    };
                    if state.slots[index].state == SlotState::Dead {
                        continue;
                    }
                    if !state.slots[index].worker.is_running() {
                        // Crashed while idle; detach it and keep looking
                        debug!(
                            "Detaching worker from pool: {}",
                            state.slots[index].worker.id()
                        );
                        state.slots[index].state = SlotState::Dead;
                        self.drained.notify_waiters();
                        continue;
                    }
                    state.slots[index].state = SlotState::Busy;
                    debug!("Idle worker found: {}", state.slots[index].worker.id());
                    return Ok(Arc::clone(&state.slots[index].worker));
                }

                if state.attached_count() == 0 {
                    return Err(PoolError::Exhausted);
                }

                debug!("Waiting for an available worker...");
                let (tx, rx) = oneshot::channel();
                state.waiting.push_back(tx);
                rx
            };

            match receiver.await {
                Ok(Ok(index)) => {
                    let mut state = self.state.lock().await;
                    // Handed over directly; the slot is already busy
                    if state.slots[index].worker.is_running() {
                        debug!(
                            "Newly available worker found: {}",
                            state.slots[index].worker.id()
                        );
                        return Ok(Arc::clone(&state.slots[index].worker));
                    }
                    state.slots[index].state = SlotState::Dead;
                    self.drained.notify_waiters();
                    // Worker died during handoff; try again
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(PoolError::Shutdown),
            }
        }
    }

    /// Return a worker to the pool. A worker that is no longer running is
    /// silently dropped; otherwise it goes to the longest-waiting caller,
    /// or onto the tail of the idle queue when nobody waits.
    pub async fn release(&self, worker: Arc<Worker>) {
        let mut state = self.state.lock().await;
        let Some(index) = state.slot_of(&worker) else {
            return;
        };
        if state.slots[index].state == SlotState::Dead {
            return;
        }
        if !worker.is_running() {
            debug!(
                "Ignoring push of worker {} back into the pool (not running)",
                worker.id()
            );
            state.slots[index].state = SlotState::Dead;
            self.drained.notify_waiters();
            return;
        }

        // Hand over directly to the longest-waiting caller; skipping the
        // idle queue here avoids wakeup races between release and acquire
        while let Some(waiter) = state.waiting.pop_front() {
            if waiter.send(Ok(index)).is_ok() {
                return;
            }
            // That caller gave up; try the next one
        }

        state.slots[index].state = SlotState::Idle;
        state.idle.push_back(index);
        self.drained.notify_waiters();
    }

    /// Permanently remove a worker from the pool. Used when its remote
    /// endpoint is confirmed unreachable: a dead endpoint would keep
    /// failing every future task while healthy workers starve.
    pub async fn fire(&self, worker: &Arc<Worker>) {
        warn!("Firing worker {}", worker.id());
        worker.kill();

        {
            let mut state = self.state.lock().await;
            let Some(index) = state.slot_of(worker) else {
                return;
            };
            if state.slots[index].state == SlotState::Dead {
                return;
            }
            state.slots[index].state = SlotState::Dead;
            state.idle.retain(|&i| i != index);

            if state.attached_count() == 0 {
                // Nothing left to serve the queue
                state.fail_waiters(PoolError::Exhausted);
            }
            self.drained.notify_waiters();
        }

        self.events.emit(
            "pool",
            EventKind::WorkerFired {
                worker_id: worker.id().to_string(),
            },
        );
    }

    /// Acquire a worker, run the task against it, classify the outcome
    /// and hand the worker back. This is the only path by which tasks
    /// reach workers. An endpoint-unavailable failure fires the worker;
    /// every other outcome returns it to circulation.
    pub async fn submit(&self, task: &dyn PoolTask) -> Result<TranscriptResult, SubmitError> {
        let worker = self.acquire().await?;

        let result = task.run(worker.config()).await;

        if let Err(PipelineError::EndpointUnavailable { .. }) = &result {
            self.fire(&worker).await;
        }
        self.release(worker).await;

        result.map_err(SubmitError::from)
    }

    /// Stop accepting new acquisitions, fail the waiting callers, then
    /// wait for in-flight work to finish.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.fail_waiters(PoolError::Shutdown);
        }

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a release between the
            // check and the await cannot be missed
            notified.as_mut().enable();
            if self.state.lock().await.busy_count() == 0 {
                break;
            }
            notified.await;
        }

        let mut state = self.state.lock().await;
        for slot in state.slots.iter_mut() {
            slot.worker.kill();
            slot.state = SlotState::Dead;
        }
        state.idle.clear();
        debug!("Worker pool has shut down");
    }

    /// Immediate, non-graceful variant of `shutdown`: every worker is
    /// stopped without waiting for in-flight work.
    pub async fn kill(&self) {
        let mut state = self.state.lock().await;
        state.shutdown = true;
        state.fail_waiters(PoolError::Shutdown);
        for slot in state.slots.iter_mut() {
            slot.worker.kill();
            slot.state = SlotState::Dead;
        }
        state.idle.clear();
        self.drained.notify_waiters();
        debug!("Worker pool has been killed");
    }
}
