//! Background workers: the orchestrator loops and the recovery loop.
//!
//! Workers share nothing but the store: each one repeatedly claims the next
//! PENDING record and drives it to a terminal status. A record failure is
//! contained in `RecordProcessor`; a store failure is logged and the worker
//! backs off, so no single record can stop a loop.
//!
//! The recovery loop runs independently on a fixed interval:
//! 1. `release_stuck`: PROCESSING rows abandoned by a crashed worker, back
//!    to PENDING or, once out of retries, to FAILED
//! 2. `requeue_failed`: FAILED rows whose backoff has elapsed

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::pipeline::processor::RecordProcessor;
use crate::store::Database;

/// Scheduling knobs for the worker pool and recovery loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// How long an idle worker waits before polling an empty queue again.
    pub idle_poll: Duration,
    /// PROCESSING rows older than this are treated as abandoned.
    pub stuck_timeout: Duration,
    pub recovery_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            idle_poll: Duration::from_secs(2),
            stuck_timeout: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(30),
        }
    }
}

/// Spawn `config.workers` orchestrator loops.
///
/// Returns the `JoinHandle`s and a shared shutdown flag. A worker finishes
/// the record it holds before observing the flag. A worker that panics is
/// restarted; the record it held stays PROCESSING until recovery releases it.
pub fn spawn_workers(
    processor: Arc<RecordProcessor>,
    config: &WorkerConfig,
) -> (Vec<JoinHandle<()>>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let count = config.workers.max(1);

    let handles = (0..count)
        .map(|worker_id| {
            let processor = Arc::clone(&processor);
            let shutdown = Arc::clone(&shutdown);
            let idle_poll = config.idle_poll;
            tokio::spawn(supervise(worker_id, processor, idle_poll, shutdown))
        })
        .collect();

    info!(workers = count, "Worker pool started");
    (handles, shutdown)
}

/// Run one worker loop, restarting it after a panic until shutdown.
async fn supervise(
    worker_id: usize,
    processor: Arc<RecordProcessor>,
    idle_poll: Duration,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let run = tokio::spawn(worker_loop(
            worker_id,
            Arc::clone(&processor),
            idle_poll,
            Arc::clone(&shutdown),
        ));
        match run.await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                error!(worker_id, "Worker panicked, restarting");
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                tokio::time::sleep(idle_poll).await;
            }
            Err(e) => {
                error!(worker_id, error = %e, "Worker task cancelled");
                return;
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    processor: Arc<RecordProcessor>,
    idle_poll: Duration,
    shutdown: Arc<AtomicBool>,
) {
    debug!(worker_id, "Worker started");
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!(worker_id, "Worker shutting down");
            return;
        }

        match processor.process_next().await {
            Ok(Some(record)) => {
                debug!(worker_id, id = %record.id, status = %record.status, "Worker finished record");
            }
            Ok(None) => tokio::time::sleep(idle_poll).await,
            Err(e) => {
                // The record (if any) stays PROCESSING; recovery returns it.
                error!(worker_id, error = %e, "Worker store error");
                tokio::time::sleep(idle_poll).await;
            }
        }
    }
}

/// Process PENDING records on the current task until none are left.
///
/// Returns how many records reached a terminal status. Used for one-shot
/// runs and tests.
pub async fn drain(processor: &RecordProcessor) -> usize {
    let mut processed = 0;
    loop {
        match processor.process_next().await {
            Ok(Some(_)) => processed += 1,
            Ok(None) => return processed,
            Err(e) => {
                error!(error = %e, "Drain stopped on store error");
                return processed;
            }
        }
    }
}

/// One recovery pass. Returns `(released, requeued)`.
///
/// `max_retries` bounds how often an abandoned record is handed out again;
/// it should match the processor's retry budget.
pub async fn recover_once(
    db: &dyn Database,
    stuck_timeout: Duration,
    max_retries: u32,
) -> (usize, usize) {
    let released = db.release_stuck(stuck_timeout, max_retries).await.unwrap_or_else(|e| {
        error!(error = %e, "release_stuck failed");
        0
    });
    let requeued = db.requeue_failed(Utc::now()).await.unwrap_or_else(|e| {
        error!(error = %e, "requeue_failed failed");
        0
    });
    (released, requeued)
}

/// Spawn the recovery loop.
pub fn spawn_recovery(
    db: Arc<dyn Database>,
    config: &WorkerConfig,
    max_retries: u32,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let interval = config.recovery_interval;
    let stuck_timeout = config.stuck_timeout;

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            stuck_timeout_secs = stuck_timeout.as_secs(),
            "Recovery loop started"
        );
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Recovery loop shutting down");
                return;
            }

            let (released, requeued) =
                recover_once(db.as_ref(), stuck_timeout, max_retries).await;
            if released + requeued > 0 {
                info!(released, requeued, "Recovery pass moved records");
            }
        }
    });

    (handle, shutdown_flag)
}
