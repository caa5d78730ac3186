//! Background task execution.
//!
//! - `TaskSpawner` is the seam between the interactive thread and whatever runs
//!   background work; every task carries a `TaskKind` label
//! - `WorkerPool` is the default: a fixed set of named threads fed by a flume queue
//! - Tasks never touch owner state; they post result messages to the owner's inbox

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::{debug, error, trace};

use crate::config::LoaderConfig;

/// How long an idle worker waits before re-checking the shutdown flag.
const IDLE_POLL_MS: u64 = 100;

/// What a background task does. Used for logging and by tests to count work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Transfer,
    MetaData,
    Decode,
    Scale,
}

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs background tasks.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, kind: TaskKind, task: Task);
}

/// Run `f`, turning a panic into an error carrying the panic message.
///
/// Task bodies use this so a panicking decoder still posts a result and the
/// owner does not wait on it forever.
pub fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string())
    })
}

struct Job {
    kind: TaskKind,
    task: Task,
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    job_tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    /// Number of workers currently running a task.
    active: Arc<AtomicUsize>,
    /// Jobs submitted but not yet finished.
    queued: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let num_workers = workers.max(1);

        // Unbounded: owners count their in-flight work and a dropped job would
        // leave them waiting forever.
        let (job_tx, job_rx) = flume::unbounded::<Job>();

        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));
        let queued = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let rx = job_rx.clone();
            let shutdown = Arc::clone(&shutdown);
            let active = Arc::clone(&active);
            let queued = Arc::clone(&queued);

            let handle = thread::Builder::new()
                .name(format!("imgdoc-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, rx, shutdown, active, queued))
                .expect("Failed to spawn imgdoc worker");
            handles.push(handle);
        }

        debug!(num_workers, "Started worker pool");

        Self {
            job_tx,
            workers: handles,
            shutdown,
            active,
            queued,
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(config.workers)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.queued.load(Ordering::Relaxed) > 0
    }

    /// Stop accepting work and join the workers. Jobs still queued are dropped;
    /// a job already running is waited for.
    pub fn shutdown(&mut self) {
        debug!("Shutting down worker pool");
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("Worker pool shutdown complete");
    }
}

impl TaskSpawner for WorkerPool {
    fn spawn(&self, kind: TaskKind, task: Task) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        if self.job_tx.send(Job { kind, task }).is_err() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            error!(?kind, "Worker pool disconnected, dropping task");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Relaxed) {
            self.shutdown();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    rx: Receiver<Job>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
) {
    trace!(worker_id, "Worker started");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match rx.recv_timeout(Duration::from_millis(IDLE_POLL_MS)) {
            Ok(job) => {
                active.fetch_add(1, Ordering::Relaxed);
                trace!(worker_id, kind = ?job.kind, "Running task");

                // A panicking decoder must not take the worker down with it.
                if panic::catch_unwind(AssertUnwindSafe(job.task)).is_err() {
                    error!(worker_id, kind = ?job.kind, "Background task panicked");
                }

                queued.fetch_sub(1, Ordering::Relaxed);
                active.fetch_sub(1, Ordering::Relaxed);
            }
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    trace!(worker_id, "Worker stopped");
}
