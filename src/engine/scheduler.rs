//! Background Scheduling
//!
//! A trigger thread polls the engine at a fixed interval and hands flush and
//! compaction jobs to a small worker pool fed by a crossbeam channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::Result;

use super::DbInner;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads draining a job channel
pub(crate) struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads.max(1) {
            let receiver: Receiver<Job> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("pmlsm-bg-{}", id))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub(crate) fn sender(&self) -> Option<Sender<Job>> {
        self.sender.clone()
    }

    /// Let queued jobs finish, then join every worker
    pub(crate) fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("background worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Trigger thread plus the pool it feeds
pub(crate) struct Scheduler {
    pool: WorkerPool,
    trigger: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn start(inner: Arc<DbInner>) -> Result<Self> {
        let pool = WorkerPool::new(inner.config.background_threads)?;
        let trigger = match pool.sender() {
            Some(jobs) => Some(
                thread::Builder::new()
                    .name("pmlsm-trigger".into())
                    .spawn(move || trigger_loop(inner, jobs))?,
            ),
            None => None,
        };
        Ok(Self { pool, trigger })
    }

    pub(crate) fn stop(&mut self) {
        if let Some(trigger) = self.trigger.take() {
            if trigger.join().is_err() {
                tracing::error!("trigger thread panicked");
            }
        }
        self.pool.shutdown();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn trigger_loop(inner: Arc<DbInner>, jobs: Sender<Job>) {
    let interval = Duration::from_millis(inner.config.trigger_interval_ms.max(1));
    tracing::debug!(?interval, "background trigger started");

    while !inner.shutdown.load(Ordering::Acquire) {
        if inner.needs_flush() && inner.try_mark_flush_pending() {
            let job_inner = Arc::clone(&inner);
            let job: Job = Box::new(move || {
                if let Err(e) = job_inner.run_flush() {
                    tracing::error!(error = %e, "background flush failed");
                }
                job_inner.mark_flush_completed();
            });
            if jobs.send(job).is_err() {
                inner.mark_flush_completed();
                break;
            }
        }

        if inner.needs_compaction() && inner.try_mark_compaction_pending() {
            let job_inner = Arc::clone(&inner);
            let job: Job = Box::new(move || {
                if let Err(e) = job_inner.compact() {
                    tracing::error!(error = %e, "background compaction failed");
                }
                job_inner.mark_compaction_completed();
            });
            if jobs.send(job).is_err() {
                inner.mark_compaction_completed();
                break;
            }
        }

        thread::sleep(interval);
    }
    tracing::debug!("background trigger stopped");
}
