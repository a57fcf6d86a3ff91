//! Bounded dispatch pool.
//!
//! A fixed set of worker tasks drains one shared FIFO backlog. Producers
//! never block: `enqueue` either inserts or drops the item with
//! `BacklogFull`. A successful enqueue wakes exactly one idle worker, if
//! there is one; a worker that finds the backlog empty marks itself idle and
//! sleeps until woken.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::frame::ConversationId;
use crate::error::{ProtocolError, Result};
use crate::protocol::conversation::Continuation;
use crate::service::peer::Peer;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout_error, SHUTDOWN_TIMEOUT};

/// One decoded inbound message waiting for a worker.
pub struct WorkItem {
    pub peer: Arc<Peer>,
    pub id: ConversationId,
    pub payload: Vec<u8>,
    /// Set when the message answers a conversation the server started.
    pub continuation: Option<Continuation>,
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("peer", &self.peer.id())
            .field("id", &self.id)
            .field("bytes", &self.payload.len())
            .field("continuation", &self.continuation)
            .finish()
    }
}

/// Processes items drawn from the backlog.
pub trait WorkHandler<T>: Send + Sync + 'static {
    fn handle(&self, item: T) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub capacity: usize,
    pub queued: usize,
    pub idle: usize,
    pub dropped: u64,
}

struct PoolState<T> {
    backlog: VecDeque<T>,
    capacity: usize,
    workers: usize,
    idle: usize,
    running: bool,
    dropped: u64,
}

pub struct DispatchPool<T = WorkItem> {
    state: Arc<Mutex<PoolState<T>>>,
    wake: Arc<Notify>,
    handler: Arc<dyn WorkHandler<T>>,
    metrics: Arc<Metrics>,
    shutdown: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> DispatchPool<T> {
    pub fn new(
        workers: usize,
        capacity: usize,
        handler: Arc<dyn WorkHandler<T>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                backlog: VecDeque::with_capacity(capacity),
                capacity,
                workers,
                idle: 0,
                running: false,
                dropped: 0,
            })),
            wake: Arc::new(Notify::new()),
            handler,
            metrics,
            shutdown: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Change pool size and backlog capacity. Only allowed while stopped.
    pub fn configure(&self, workers: usize, capacity: usize) -> Result<()> {
        if workers == 0 || capacity == 0 {
            return Err(ProtocolError::ConfigError(
                "Worker count and backlog capacity must be greater than 0".to_string(),
            ));
        }
        let mut state = self.state.lock();
        if state.running {
            return Err(ProtocolError::PoolRunning);
        }
        state.workers = workers;
        state.capacity = capacity;
        debug!(workers, capacity, "Dispatch pool configured");
        Ok(())
    }

    /// Insert without blocking. A full backlog drops the item.
    pub fn enqueue(&self, item: T) -> Result<()> {
        let wake_one = {
            let mut state = self.state.lock();
            if state.backlog.len() >= state.capacity {
                state.dropped += 1;
                let capacity = state.capacity;
                drop(state);
                self.metrics.work_dropped();
                return Err(ProtocolError::BacklogFull(capacity));
            }
            state.backlog.push_back(item);
            if state.idle > 0 {
                state.idle -= 1;
                true
            } else {
                false
            }
        };
        self.metrics.work_enqueued();
        if wake_one {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Spawn the workers.
    pub fn start(&self) -> Result<()> {
        let workers = {
            let mut state = self.state.lock();
            if state.running {
                return Err(ProtocolError::PoolRunning);
            }
            state.running = true;
            state.idle = 0;
            state.workers
        };

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let mut tasks = self.tasks.lock();
        for index in 0..workers {
            let worker = Worker {
                index,
                state: self.state.clone(),
                wake: self.wake.clone(),
                handler: self.handler.clone(),
                metrics: self.metrics.clone(),
                shutdown: token.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }
        info!(workers, capacity = self.capacity(), "Dispatch pool started");
        Ok(())
    }

    /// Stop the workers after their current item and drop whatever is
    /// still queued.
    pub async fn shutdown(&self) {
        self.shutdown.lock().cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let joined = with_timeout_error(
            async {
                futures::future::join_all(tasks).await;
                Ok(())
            },
            SHUTDOWN_TIMEOUT,
        )
        .await;
        if joined.is_err() {
            warn!("Dispatch workers did not stop in time");
        }

        let discarded = {
            let mut state = self.state.lock();
            state.running = false;
            state.idle = 0;
            state.backlog.drain(..).count()
        };
        if discarded > 0 {
            warn!(discarded, "Discarded queued work on shutdown");
        }
        info!("Dispatch pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            workers: state.workers,
            capacity: state.capacity,
            queued: state.backlog.len(),
            idle: state.idle,
            dropped: state.dropped,
        }
    }
}

struct Worker<T> {
    index: usize,
    state: Arc<Mutex<PoolState<T>>>,
    wake: Arc<Notify>,
    handler: Arc<dyn WorkHandler<T>>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl<T: Send + 'static> Worker<T> {
    async fn run(self) {
        debug!(worker = self.index, "Worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            // Register for a wakeup before counting as idle, so every
            // `notify_one` issued against the idle count finds a waiter.
            let notified = self.wake.notified();
            tokio::pin!(notified);
            let next = {
                let mut state = self.state.lock();
                let next = state.backlog.pop_front();
                if next.is_none() {
                    notified.as_mut().enable();
                    state.idle += 1;
                }
                next
            };

            match next {
                Some(item) => self.process(item).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = &mut notified => {}
                    }
                }
            }
        }
        debug!(worker = self.index, "Worker stopped");
    }

    async fn process(&self, item: T) {
        let outcome = AssertUnwindSafe(self.handler.handle(item))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.metrics.handler_fault();
                warn!(worker = self.index, error = %e, "Work item failed");
            }
            Err(_) => {
                self.metrics.handler_fault();
                error!(worker = self.index, "Work item panicked");
            }
        }
    }
}
