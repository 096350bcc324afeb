//! Bounded worker pool for CPU-heavy indicator math.
//!
//! A fixed set of OS threads pulls from a shared priority queue so indicator
//! computation never runs on the async ingestion loop. Requests and replies
//! are correlated by task id over oneshot channels; a caller that times out
//! drops its receiver and any late result is discarded.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use ta::indicators::{ExponentialMovingAverage, RelativeStrengthIndex};
use ta::Next;
use tokio::sync::oneshot;

use crate::config::PoolConfig;
use crate::error::AlertflowError;

#[derive(Debug, Clone)]
pub enum TaskKind {
    /// RSI over the full price slice; needs at least `period + 1` values.
    Rsi { prices: Vec<f64>, period: usize },
    /// EMA over the full price slice; needs at least `period` values.
    Ema { prices: Vec<f64>, period: usize },
    /// Diagnostic task: hold a worker for `hold_ms`, then succeed with 1.0
    /// or fail. Used by health checks and tests.
    Probe { hold_ms: u64, fail: bool },
}

impl TaskKind {
    fn compute(&self) -> Result<f64, AlertflowError> {
        match self {
            TaskKind::Rsi { prices, period } => {
                if prices.len() < period + 1 {
                    return Err(AlertflowError::Evaluation(format!(
                        "RSI({}) needs {} prices, got {}",
                        period,
                        period + 1,
                        prices.len()
                    )));
                }
                let mut rsi = RelativeStrengthIndex::new(*period)
                    .map_err(|e| AlertflowError::Evaluation(format!("bad RSI period: {}", e)))?;
                let value = prices.iter().fold(0.0, |_, &p| rsi.next(p));
                Ok(value)
            }
            TaskKind::Ema { prices, period } => {
                if prices.len() < *period {
                    return Err(AlertflowError::Evaluation(format!(
                        "EMA({}) needs {} prices, got {}",
                        period,
                        period,
                        prices.len()
                    )));
                }
                let mut ema = ExponentialMovingAverage::new(*period)
                    .map_err(|e| AlertflowError::Evaluation(format!("bad EMA period: {}", e)))?;
                let value = prices.iter().fold(0.0, |_, &p| ema.next(p));
                Ok(value)
            }
            TaskKind::Probe { hold_ms, fail } => {
                if *hold_ms > 0 {
                    std::thread::sleep(Duration::from_millis(*hold_ms));
                }
                if *fail {
                    Err(AlertflowError::WorkerFailed("probe failure".to_string()))
                } else {
                    Ok(1.0)
                }
            }
        }
    }
}

struct QueuedTask {
    id: u64,
    kind: TaskKind,
    priority: u8,
    /// Monotonic submission order; breaks ties FIFO among equal priorities.
    seq: u64,
    reply: oneshot::Sender<Result<f64, AlertflowError>>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence (earlier
        // submission) first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queue_depth: usize,
    pub retired: usize,
}

struct QueueState {
    queue: BinaryHeap<QueuedTask>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    busy: AtomicUsize,
    workers: AtomicUsize,
    retired: AtomicUsize,
    next_worker_id: AtomicU64,
    error_threshold: u32,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    queue_cap: usize,
    task_timeout: Duration,
    next_task_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Self {
        let workers = config.effective_workers();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: BinaryHeap::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            busy: AtomicUsize::new(0),
            workers: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
            next_worker_id: AtomicU64::new(0),
            error_threshold: config.error_threshold,
        });
        for _ in 0..workers {
            spawn_worker(Arc::clone(&shared));
        }
        info!("worker pool started with {} workers", workers);
        Self {
            shared,
            queue_cap: config.queue_cap,
            task_timeout: Duration::from_millis(config.task_timeout_ms),
            next_task_id: AtomicU64::new(0),
        }
    }

    /// Enqueues a task and waits for its result. Higher priority dequeues
    /// first; FIFO among equals. Fails fast when the queue is at capacity
    /// and gives up after the configured timeout, discarding any late
    /// result by correlation id.
    pub async fn execute(&self, kind: TaskKind, priority: u8) -> Result<f64, AlertflowError> {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return Err(AlertflowError::WorkerFailed("pool stopped".to_string()));
            }
            if state.queue.len() >= self.queue_cap {
                return Err(AlertflowError::QueueFull(state.queue.len()));
            }
            state.queue.push(QueuedTask {
                id,
                kind,
                priority,
                seq: id,
                reply: tx,
            });
        }
        self.shared.available.notify_one();

        match tokio::time::timeout(self.task_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AlertflowError::WorkerFailed(
                "worker dropped the reply channel".to_string(),
            )),
            Err(_) => Err(AlertflowError::TaskTimeout(id)),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    pub fn busy_workers(&self) -> usize {
        self.shared.busy.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.shared.workers.load(Ordering::Relaxed),
            busy: self.shared.busy.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
            retired: self.shared.retired.load(Ordering::Relaxed),
        }
    }

    /// Wakes all workers to exit. Queued tasks that were not yet dispatched
    /// get their reply channels dropped, which callers observe as errors.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        state.queue.clear();
        drop(state);
        self.shared.available.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(shared: Arc<Shared>) {
    let worker_id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
    shared.workers.fetch_add(1, Ordering::Relaxed);
    let spawned = std::thread::Builder::new()
        .name(format!("alertflow-worker-{}", worker_id))
        .spawn(move || worker_loop(shared, worker_id));
    if let Err(e) = spawned {
        error!("failed to spawn worker thread: {}", e);
    }
}

fn worker_loop(shared: Arc<Shared>, worker_id: u64) {
    let mut errors: u32 = 0;
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    shared.workers.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
                if let Some(task) = state.queue.pop() {
                    break task;
                }
                state = shared.available.wait(state).unwrap();
            }
        };

        shared.busy.fetch_add(1, Ordering::Relaxed);
        let result = task.kind.compute();
        shared.busy.fetch_sub(1, Ordering::Relaxed);

        let failed = result.is_err();
        if let Err(ref e) = result {
            warn!("worker {} task {} failed: {}", worker_id, task.id, e);
        }
        if task.reply.send(result).is_err() {
            // Caller timed out and dropped its receiver; the correlation id
            // is gone, so the result is discarded here.
            debug!(
                "worker {} discarding late result for task {}",
                worker_id, task.id
            );
        }

        if failed {
            errors += 1;
            if errors > shared.error_threshold {
                shared.retired.fetch_add(1, Ordering::Relaxed);
                shared.workers.fetch_sub(1, Ordering::Relaxed);
                warn!(
                    "worker {} retiring after {} errors, spawning replacement",
                    worker_id, errors
                );
                if !shared.state.lock().unwrap().shutdown {
                    spawn_worker(Arc::clone(&shared));
                }
                return;
            }
        }
    }
}
