//! Worker threads running the dispatcher loop.

use std::io;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, info_span};

use secx_broker::Broker;

use super::dispatcher::{Dispatcher, Disposition};
use crate::jobs::JobStore;

/// Pause after a failed lease before polling the broker again.
const LEASE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// How long each lease call blocks
    pub lease_timeout: Duration,
    /// Thread name prefix for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_timeout: Duration::from_secs(5),
            name: "secx-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Pool runtime statistics (all workers combined).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub discarded: u64,
    pub requeued: u64,
    pub lease_errors: u64,
    pub uptime_secs: u64,
}

impl PoolStats {
    fn record(&mut self, disposition: &Disposition) {
        self.processed += 1;
        match disposition {
            Disposition::Completed => self.completed += 1,
            Disposition::Retrying { .. } => self.retried += 1,
            Disposition::Failed => self.failed += 1,
            Disposition::Discarded(_) => self.discarded += 1,
            Disposition::Requeued { .. } => self.requeued += 1,
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    workers: Vec<(mpsc::Sender<()>, thread::JoinHandle<()>)>,
    stats: Arc<Mutex<PoolStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for every worker to stop.
    ///
    /// A worker finishes the message it is handling (including a running
    /// extraction) before it exits.
    pub fn shutdown(self) {
        for (shutdown, _) in &self.workers {
            let _ = shutdown.send(());
        }
        for (_, join) in self.workers {
            let _ = join.join();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Fixed set of threads, each running lease → handle in a loop.
///
/// Workers share only the dispatcher (which holds no per-message state) and
/// the stats counters.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn<S, B>(dispatcher: Arc<Dispatcher<S, B>>, config: WorkerPoolConfig) -> io::Result<WorkerPoolHandle>
    where
        S: JobStore + 'static,
        B: Broker + 'static,
    {
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let mut workers = Vec::with_capacity(config.workers);

        for index in 0..config.workers.max(1) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let name = format!("{}-{}", config.name, index);
            let dispatcher = dispatcher.clone();
            let worker_stats = stats.clone();
            let lease_timeout = config.lease_timeout;

            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                worker_loop(&name, &dispatcher, lease_timeout, &shutdown_rx, &worker_stats)
            });

            match spawned {
                Ok(join) => workers.push((shutdown_tx, join)),
                Err(e) => {
                    // Stop the workers that did start before reporting.
                    WorkerPoolHandle {
                        workers,
                        stats,
                        started: Instant::now(),
                    }
                    .shutdown();
                    return Err(e);
                }
            }
        }

        info!(workers = workers.len(), pool = %config.name, "worker pool started");
        Ok(WorkerPoolHandle {
            workers,
            stats,
            started: Instant::now(),
        })
    }
}

fn worker_loop<S, B>(
    name: &str,
    dispatcher: &Dispatcher<S, B>,
    lease_timeout: Duration,
    shutdown_rx: &mpsc::Receiver<()>,
    stats: &Mutex<PoolStats>,
) where
    S: JobStore,
    B: Broker,
{
    let span = info_span!("worker", worker = %name);
    let _entered = span.enter();
    info!("worker started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match dispatcher.process_next(lease_timeout) {
            Ok(Some(disposition)) => {
                if let Ok(mut s) = stats.lock() {
                    s.record(&disposition);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "failed to lease message");
                if let Ok(mut s) = stats.lock() {
                    s.lease_errors += 1;
                }
                // Doubles as the backoff sleep; wakes early on shutdown.
                if shutdown_rx.recv_timeout(LEASE_ERROR_BACKOFF).is_ok() {
                    break;
                }
            }
        }
    }

    info!("worker stopped");
}
