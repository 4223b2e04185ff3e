//! Worker pool: fixed number of poll → claim → execute loops.
//!
//! Each worker is a tokio task. An empty poll doubles the wait (starting at
//! the poll interval, capped at the max idle backoff); a claimed job resets
//! it. Claim errors are logged and retried on the next tick. On stop, a
//! worker finishes its in-flight job and exits.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::workflow::Executor;

pub struct WorkerPool {
    executor: Executor,
    poll_interval: Duration,
    max_idle_backoff: Duration,
}

impl WorkerPool {
    pub fn new(executor: Executor, poll_interval: Duration, max_idle_backoff: Duration) -> Self {
        Self {
            executor,
            poll_interval,
            max_idle_backoff: max_idle_backoff.max(poll_interval),
        }
    }

    /// Spawn `workers` loops on the current runtime.
    pub fn start(&self, workers: usize) -> WorkerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let tasks = (1..=workers.max(1))
            .map(|id| {
                let executor = self.executor.clone();
                let stop = stop_rx.clone();
                let poll = self.poll_interval;
                let max_backoff = self.max_idle_backoff;
                tokio::spawn(async move { worker_loop(id, executor, poll, max_backoff, stop).await })
            })
            .collect::<Vec<_>>();
        tracing::info!("[WorkerPool] Started {} workers", tasks.len());
        WorkerHandle { stop: stop_tx, tasks }
    }
}

pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask every worker to stop claiming new jobs.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Stop and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.stop();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("[WorkerPool] Worker task panicked: {}", e);
            }
        }
        tracing::info!("[WorkerPool] All workers stopped");
    }
}

async fn worker_loop(
    id: usize,
    executor: Executor,
    poll_interval: Duration,
    max_backoff: Duration,
    mut stop: watch::Receiver<bool>,
) {
    tracing::debug!("[Worker {}] Started", id);
    let mut backoff = poll_interval;
    loop {
        if *stop.borrow() {
            break;
        }

        match executor.jobs().claim().await {
            Ok(Some(job)) => {
                backoff = poll_interval;
                tracing::info!("[Worker {}] Claimed job {}", id, job.id);
                let job_id = job.id.clone();
                match executor.run_claimed(job).await {
                    Ok(done) => tracing::info!("[Worker {}] Job {} finished: {}", id, done.id, done.status),
                    Err(e) => tracing::error!("[Worker {}] Job {} aborted: {}", id, job_id, e),
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("[Worker {}] Claim failed, retrying: {}", id, e),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        backoff = (backoff * 2).min(max_backoff);
    }
    tracing::debug!("[Worker {}] Stopped", id);
}
