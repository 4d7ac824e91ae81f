//! Bounded queue decoupling NPC selection from generation latency.
//!
//! Multiple producers (the ingress path) feed a bounded channel; a fixed
//! worker pool drains it. A semaphore sized to the pool additionally bounds
//! simultaneous in-flight generations even if the pool size changes. When
//! the queue is full, `enqueue` suspends the producer — explicit
//! backpressure, never a drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::NpcActivationCache;
use crate::config::QueueConfig;
use crate::error::{ChatError, Result};
use crate::message::Message;

/// One unit of AI-generation work. Ephemeral: consumed exactly once by a
/// worker, never persisted.
#[derive(Debug, Clone)]
pub struct ResponseJob {
    pub session_id: i64,
    pub npc_id: i64,
    pub npc_name: String,
    /// The message text that triggered selection.
    pub trigger: String,
    /// Conversation snapshot taken at selection time.
    pub context: Vec<Message>,
    /// 1–10; carried for observability and provider hints.
    pub priority: u8,
    pub enqueued_at: Instant,
}

/// Work performed by a queue worker for each job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: ResponseJob) -> Result<()>;
}

/// Bounded multi-producer queue with a fixed worker pool.
pub struct ResponseJobQueue {
    tx: tokio::sync::Mutex<Option<mpsc::Sender<ResponseJob>>>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<ResponseJob>>>,
    depth: Arc<AtomicUsize>,
    last_completed: Arc<std::sync::Mutex<Instant>>,
    limiter: Arc<Semaphore>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    config: QueueConfig,
}

impl ResponseJobQueue {
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        Self {
            tx: tokio::sync::Mutex::new(Some(tx)),
            rx: std::sync::Mutex::new(Some(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
            last_completed: Arc::new(std::sync::Mutex::new(Instant::now())),
            limiter: Arc::new(Semaphore::new(config.workers.max(1))),
            workers: std::sync::Mutex::new(Vec::new()),
            config,
        }
    }

    /// Enqueue a job, suspending when the queue is at capacity.
    ///
    /// Callers on a latency-critical path must account for this suspension.
    pub async fn enqueue(&self, job: ResponseJob) -> Result<()> {
        let sender = {
            let guard = self.tx.lock().await;
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(ChatError::Channel("response queue is shut down".to_owned()));
        };

        // Count the job before it can reach a worker, otherwise a fast
        // completion could decrement first and leave the counter high by
        // one forever. A producer parked on a full channel is therefore
        // part of the reported backlog.
        self.depth.fetch_add(1, Ordering::Relaxed);
        if sender.send(job).await.is_err() {
            let _ = self.depth.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
            return Err(ChatError::Channel("response queue closed".to_owned()));
        }
        Ok(())
    }

    /// Start the worker pool.
    ///
    /// Workers re-validate that the target NPC is still active + visible
    /// before executing; stale jobs are silently dropped. Call once.
    pub fn spawn_workers(&self, executor: Arc<dyn JobExecutor>, cache: Arc<NpcActivationCache>) {
        let rx = self.rx.lock().ok().and_then(|mut guard| guard.take());
        let Some(rx) = rx else {
            warn!("response queue workers already started");
            return;
        };

        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        let worker_count = self.config.workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&shared_rx),
                Arc::clone(&self.limiter),
                Arc::clone(&executor),
                Arc::clone(&cache),
                Arc::clone(&self.depth),
                Arc::clone(&self.last_completed),
            )));
        }
        if let Ok(mut workers) = self.workers.lock() {
            workers.extend(handles);
        }
        info!(workers = worker_count, "response queue workers started");
    }

    /// Current queue depth (enqueued, not yet completed).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Health predicate: unhealthy when the backlog is large or when jobs
    /// are pending but nothing has completed recently (saturation signals).
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let depth = self.depth();
        if depth >= self.config.unhealthy_depth {
            return false;
        }
        if depth > 0 {
            let stalled = self
                .last_completed
                .lock()
                .map(|last| last.elapsed() >= self.config.unhealthy_idle())
                .unwrap_or(true);
            if stalled {
                return false;
            }
        }
        true
    }

    /// Stop accepting new jobs, drain in-flight workers, and join them.
    ///
    /// Idempotent: repeated invocation is a no-op.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.tx.lock().await;
            if guard.take().is_none() {
                return;
            }
        }
        info!("response queue input closed; draining workers");

        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .map(|mut w| w.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("response queue worker join failed: {e}");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    shared_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ResponseJob>>>,
    limiter: Arc<Semaphore>,
    executor: Arc<dyn JobExecutor>,
    cache: Arc<NpcActivationCache>,
    depth: Arc<AtomicUsize>,
    last_completed: Arc<std::sync::Mutex<Instant>>,
) {
    loop {
        // Only one worker parks on recv at a time; execution happens after
        // the lock is released so workers still run in parallel.
        let job = {
            let mut rx = shared_rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            debug!(worker_id, "response queue worker exiting");
            break;
        };

        let permit = match Arc::clone(&limiter).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        // State may have changed while the job sat in the queue.
        let still_live = cache
            .get(job.session_id, job.npc_id)
            .ok()
            .flatten()
            .is_some_and(|state| state.can_respond());
        if still_live {
            if let Err(e) = executor.execute(job.clone()).await {
                warn!(
                    session = job.session_id,
                    npc = job.npc_name.as_str(),
                    "response job failed: {e}"
                );
            }
        } else {
            debug!(
                session = job.session_id,
                npc = job.npc_name.as_str(),
                "dropping stale response job"
            );
        }

        note_completion(&depth, &last_completed);
        drop(permit);
    }
}

/// Floor-clamped decrement tolerates double-completion races.
fn note_completion(depth: &AtomicUsize, last_completed: &std::sync::Mutex<Instant>) {
    let _ = depth.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
        Some(d.saturating_sub(1))
    });
    if let Ok(mut last) = last_completed.lock() {
        *last = Instant::now();
    }
}
