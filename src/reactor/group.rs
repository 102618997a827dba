//! Fixed-size pool of event-loop workers.
//!
//! Size is set at construction and never changes; connections assigned to
//! a worker stay there for life. New work is spread round-robin.

use crate::reactor::worker::{self, Task, WorkerHandle, WorkerOptions};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

pub struct EventLoopGroup {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
    shutdown: AtomicBool,
}

impl EventLoopGroup {
    /// Spawn `size` workers (at least one) named `{name}-{i}`.
    pub fn new(name: &str, size: usize, opts: WorkerOptions) -> io::Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(worker::spawn(name, id, opts.clone())?);
        }
        debug!(group = name, size, "event loop group started");

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Pick the worker for the next piece of work, round-robin.
    pub fn next(&self) -> &WorkerHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    /// Signal every worker to drain and wait up to `timeout` for the
    /// threads to exit. Returns the ids of workers still running when the
    /// deadline passed. Idempotent; a second call returns immediately.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Vec<usize> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        for handle in &self.workers {
            let _ = handle.submit(Task::Shutdown {
                drain: quiet_period,
            });
        }

        let deadline = Instant::now() + timeout;
        let mut stragglers = Vec::new();
        for handle in &self.workers {
            if !handle.join_by(deadline) {
                stragglers.push(handle.id());
            }
        }
        stragglers
    }
}
