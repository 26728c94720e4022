//! Delivery run loops
//!
//! Each worker is an OS thread draining its own queue in FIFO order. A
//! request is pinned to one worker for its lifetime; coalesced deliveries for
//! that request are posted to the worker's queue instead of being executed on
//! the leader's thread.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::coalesce::{DeliveryTask, ExecutionContext};
use crate::error::{CacheError, CacheResult};

enum Message {
    Run(DeliveryTask),
    Shutdown,
}

/// Posting side of one run loop
#[derive(Clone)]
pub struct RunLoopHandle {
    id: usize,
    tx: mpsc::UnboundedSender<Message>,
}

impl RunLoopHandle {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl ExecutionContext for RunLoopHandle {
    fn post(&self, task: DeliveryTask) {
        if self.tx.send(Message::Run(task)).is_err() {
            warn!(worker = self.id, "Run loop stopped, dropping delivery");
        }
    }
}

pub struct WorkerPool {
    handles: Vec<RunLoopHandle>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> CacheResult<Self> {
        if workers == 0 {
            return Err(CacheError::ConfigError(
                "worker pool needs at least one run loop".to_string(),
            ));
        }

        let mut handles = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);

        for id in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let thread = thread::Builder::new()
                .name(format!("ringcache-worker-{}", id))
                .spawn(move || run_loop(id, rx))
                .map_err(|e| {
                    CacheError::Internal(format!("Failed to spawn worker {}: {}", id, e))
                })?;

            handles.push(RunLoopHandle { id, tx });
            threads.push(thread);
        }

        info!(workers = workers, "Started delivery run loops");

        Ok(Self {
            handles,
            threads: Mutex::new(threads),
            next: AtomicUsize::new(0),
        })
    }

    /// Round-robin assignment of run loops to incoming requests
    pub fn next(&self) -> RunLoopHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[index].clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every run loop after the tasks already queued, and wait for them.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            let _ = handle.tx.send(Message::Shutdown);
        }

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
        info!("Delivery run loops stopped");
    }
}

fn run_loop(id: usize, mut rx: mpsc::UnboundedReceiver<Message>) {
    debug!(worker = id, "Run loop started");
    while let Some(message) = rx.blocking_recv() {
        match message {
            Message::Run(task) => task(),
            Message::Shutdown => break,
        }
    }
    debug!(worker = id, "Run loop exited");
}
